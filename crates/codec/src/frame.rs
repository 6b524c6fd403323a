//! Length-prefixed framing.
//!
//! Every message is one frame: a 4-byte big-endian payload length
//! followed by that many bytes of CBOR. A zero length is invalid and
//! [`MAX_FRAME_SIZE`] bounds allocations on the receive path.

use bytes::{BufMut, BytesMut};

use crate::Error;

/// The number of bytes in the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on the payload of a single frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Returns the total size (header included) of the frame at the start
/// of `buf`, or `None` when more bytes are needed.
///
/// # Test
///
/// ```
/// use mash_codec::frame::frame_size;
///
/// assert_eq!(frame_size(&[0, 0]).unwrap(), None);
/// assert_eq!(frame_size(&[0, 0, 0, 2, 0xa0]).unwrap(), None);
/// assert_eq!(frame_size(&[0, 0, 0, 1, 0xa0]).unwrap(), Some(5));
/// assert!(frame_size(&[0, 0, 0, 0]).is_err());
/// ```
pub fn frame_size(buf: &[u8]) -> Result<Option<usize>, Error> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let size = u32::from_be_bytes(buf[..FRAME_HEADER_SIZE].try_into()?) as usize;
    if size == 0 {
        return Err(Error::EmptyFrame);
    }

    if size > MAX_FRAME_SIZE {
        return Err(Error::FrameOversize);
    }

    if buf.len() < FRAME_HEADER_SIZE + size {
        return Ok(None);
    }

    Ok(Some(FRAME_HEADER_SIZE + size))
}

/// Appends `payload` to `out` as a single frame.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) -> Result<(), Error> {
    if payload.is_empty() {
        return Err(Error::EmptyFrame);
    }

    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameOversize);
    }

    out.reserve(FRAME_HEADER_SIZE + payload.len());
    out.put_u32(payload.len() as u32);
    out.put(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut out = BytesMut::new();
        encode_frame(&[0xa0], &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1, 0xa0]);
        assert_eq!(frame_size(&out).unwrap(), Some(5));
    }

    #[test]
    fn oversize_rejected_both_ways() {
        let mut out = BytesMut::new();
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload, &mut out),
            Err(Error::FrameOversize)
        ));

        let mut header = BytesMut::new();
        header.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(frame_size(&header), Err(Error::FrameOversize)));
    }

    #[test]
    fn partial_frames_ask_for_more() {
        let mut out = BytesMut::new();
        encode_frame(&[1, 2, 3, 4], &mut out).unwrap();

        for cut in 0..out.len() {
            assert_eq!(frame_size(&out[..cut]).unwrap(), None);
        }

        assert_eq!(frame_size(&out).unwrap(), Some(out.len()));
    }
}
