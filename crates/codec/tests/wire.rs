use anyhow::Result;
use bytes::BytesMut;
use ciborium::Value;

use mash_codec::frame::{FRAME_HEADER_SIZE, encode_frame, frame_size};
use mash_codec::message::commissioning::{CommissioningMessage, CommissioningMsgType, NONCE_SIZE};
use mash_codec::message::{Notification, Op, Request, Response, Status, WireMessage};
use mash_codec::{MessageType, peek_message_type};

#[test]
fn framed_stream_splits_back_into_messages() -> Result<()> {
    let messages = vec![
        WireMessage::Request(Request {
            op: Op::Read,
            message_id: 1,
            endpoint_id: 0,
            feature_id: 1,
            payload: Value::Null,
        }),
        WireMessage::Response(Response {
            message_id: 1,
            status: Status::Success,
            payload: Value::Array(vec![Value::Integer(1.into())]),
        }),
        WireMessage::Notification(Notification {
            subscription_id: 9,
            endpoint_id: 1,
            feature_id: 4,
            changes: vec![(2, Value::Integer(11000.into()))],
        }),
        WireMessage::Commissioning(CommissioningMessage::Error {
            code: Status::Busy,
            retry_after_secs: 0,
        }),
    ];

    // Write everything into one contiguous stream buffer.
    let mut stream = BytesMut::new();
    for message in &messages {
        encode_frame(&message.encode()?, &mut stream)?;
    }

    // Read it back frame by frame, the way the session read loop does.
    let mut decoded = Vec::new();
    while !stream.is_empty() {
        let size = frame_size(&stream)?.expect("whole frames in buffer");
        let frame = stream.split_to(size);
        decoded.push(WireMessage::decode(&frame[FRAME_HEADER_SIZE..])?);
    }

    assert_eq!(decoded, messages);
    Ok(())
}

#[test]
fn peek_agrees_with_full_decode() -> Result<()> {
    let samples: Vec<(WireMessage, MessageType)> = vec![
        (
            WireMessage::Request(Request {
                op: Op::Invoke,
                message_id: 77,
                endpoint_id: 0,
                feature_id: 0x30,
                payload: Value::Null,
            }),
            MessageType::Request,
        ),
        (
            WireMessage::Response(Response {
                message_id: 77,
                status: Status::NotFound,
                payload: Value::Null,
            }),
            MessageType::Response,
        ),
        (
            WireMessage::Notification(Notification {
                subscription_id: 2,
                endpoint_id: 3,
                feature_id: 4,
                changes: vec![],
            }),
            MessageType::Notification,
        ),
        (
            WireMessage::Commissioning(CommissioningMessage::CertRenewalRequest {
                nonce: [0xee; NONCE_SIZE],
                zone_ca: vec![0x30, 0x82],
                zone_type: 0,
            }),
            MessageType::Commissioning(CommissioningMsgType::CertRenewalRequest),
        ),
    ];

    for (message, expected) in samples {
        let bytes = message.encode()?;
        assert_eq!(peek_message_type(&bytes)?, expected);
        assert_eq!(WireMessage::decode(&bytes)?, message);
    }

    Ok(())
}

#[test]
fn zero_length_frame_is_invalid() {
    assert!(frame_size(&[0, 0, 0, 0, 0xa0]).is_err());
}
