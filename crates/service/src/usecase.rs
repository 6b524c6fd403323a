//! Use-case matching.
//!
//! A registry of use-case definitions is matched against a device
//! profile, producing a scenario bitmap per use case. Scenario
//! constraints (`requires`, `requires_any`) are enforced by a
//! fixed-point iteration so dependency chains resolve no matter the
//! declaration order.

use std::collections::BTreeMap;

use ciborium::Value;

use crate::model::Device;

/// What the matcher sees of a device: structure plus captured
/// attribute values for scalar predicates.
#[derive(Debug, Clone, Default)]
pub struct DeviceProfile {
    pub endpoints: Vec<EndpointProfile>,
}

#[derive(Debug, Clone)]
pub struct EndpointProfile {
    pub id: u8,
    pub kind: u8,
    pub features: Vec<FeatureProfile>,
}

#[derive(Debug, Clone)]
pub struct FeatureProfile {
    pub type_id: u16,
    pub feature_map: u32,
    pub attributes: Vec<u16>,
    pub commands: Vec<u8>,
    pub values: BTreeMap<u16, Value>,
}

impl From<&Device> for DeviceProfile {
    fn from(device: &Device) -> Self {
        Self {
            endpoints: device
                .endpoints()
                .map(|endpoint| EndpointProfile {
                    id: endpoint.id,
                    kind: endpoint.kind,
                    features: endpoint
                        .features()
                        .map(|(_, feature)| FeatureProfile {
                            type_id: feature.type_id,
                            feature_map: feature.feature_map,
                            attributes: feature.attribute_list.clone(),
                            commands: feature.command_list.clone(),
                            values: feature
                                .attribute_list
                                .iter()
                                .filter_map(|id| {
                                    feature.attribute(*id).map(|value| (*id, value.clone()))
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// A scalar predicate over a captured attribute value, e.g.
/// "accepts limits" must be true.
#[derive(Debug, Clone)]
pub struct AttributePredicate {
    pub attribute: u16,
    pub equals: Value,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureRequirement {
    pub feature_type: u16,
    pub attributes: Vec<u16>,
    pub commands: Vec<u8>,
    pub predicates: Vec<AttributePredicate>,
}

#[derive(Debug, Clone, Default)]
pub struct ScenarioDef {
    pub name: String,
    /// Bit position in the use case's scenario bitmap.
    pub bit: u8,
    /// Extra endpoint-type filter; empty inherits the use case's.
    pub endpoint_types: Vec<u8>,
    pub features: Vec<FeatureRequirement>,
    /// All named scenarios must be present.
    pub requires: Vec<String>,
    /// At least one named scenario must be present.
    pub requires_any: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UseCaseDef {
    pub name: String,
    pub endpoint_types: Vec<u8>,
    pub scenarios: Vec<ScenarioDef>,
}

/// Matching outcome: scenario bitmap per use case, plus the first
/// endpoint that matched each use case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchResult {
    pub use_cases: BTreeMap<String, u32>,
    pub endpoint_for_use_case: BTreeMap<String, u8>,
}

/// Deterministic match of a device profile against the registry.
pub fn match_profile(profile: &DeviceProfile, registry: &[UseCaseDef]) -> MatchResult {
    let mut result = MatchResult::default();

    for endpoint in &profile.endpoints {
        for use_case in registry {
            if !use_case.endpoint_types.is_empty()
                && !use_case.endpoint_types.contains(&endpoint.kind)
            {
                continue;
            }

            let bitmap = match_endpoint(endpoint, use_case);
            if bitmap == 0 {
                continue;
            }

            *result.use_cases.entry(use_case.name.clone()).or_insert(0) |= bitmap;
            result
                .endpoint_for_use_case
                .entry(use_case.name.clone())
                .or_insert(endpoint.id);
        }
    }

    result
}

fn match_endpoint(endpoint: &EndpointProfile, use_case: &UseCaseDef) -> u32 {
    // Pass one: raw feature requirements.
    let mut present: Vec<&ScenarioDef> = use_case
        .scenarios
        .iter()
        .filter(|scenario| scenario_applies(endpoint, scenario))
        .collect();

    // Pass two: constraint fixpoint. Stripping one scenario can
    // invalidate another, so iterate until the set stabilises; chains
    // like S2 -> S1 -> BASE resolve in as many rounds as they are
    // deep.
    loop {
        let names: Vec<&str> = present.iter().map(|it| it.name.as_str()).collect();

        let survivors: Vec<&ScenarioDef> = present
            .iter()
            .copied()
            .filter(|scenario| {
                let requires_ok = scenario
                    .requires
                    .iter()
                    .all(|name| names.contains(&name.as_str()));

                let requires_any_ok = scenario.requires_any.is_empty()
                    || scenario
                        .requires_any
                        .iter()
                        .any(|name| names.contains(&name.as_str()));

                requires_ok && requires_any_ok
            })
            .collect();

        if survivors.len() == present.len() {
            break;
        }

        present = survivors;
    }

    present
        .iter()
        .fold(0u32, |bitmap, scenario| bitmap | (1 << scenario.bit))
}

fn scenario_applies(endpoint: &EndpointProfile, scenario: &ScenarioDef) -> bool {
    if !scenario.endpoint_types.is_empty() && !scenario.endpoint_types.contains(&endpoint.kind) {
        return false;
    }

    scenario.features.iter().all(|requirement| {
        endpoint
            .features
            .iter()
            .any(|feature| feature_satisfies(feature, requirement))
    })
}

fn feature_satisfies(feature: &FeatureProfile, requirement: &FeatureRequirement) -> bool {
    if feature.type_id != requirement.feature_type {
        return false;
    }

    if !requirement
        .attributes
        .iter()
        .all(|id| feature.attributes.contains(id))
    {
        return false;
    }

    if !requirement
        .commands
        .iter()
        .all(|id| feature.commands.contains(id))
    {
        return false;
    }

    requirement
        .predicates
        .iter()
        .all(|predicate| feature.values.get(&predicate.attribute) == Some(&predicate.equals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ENDPOINT_TYPE_EV_CHARGER, ENDPOINT_TYPE_INVERTER};

    const FEATURE_MEASUREMENT: u16 = 0x0041;
    const FEATURE_LIMITS: u16 = 0x0050;

    fn feature(type_id: u16, attributes: &[u16], commands: &[u8]) -> FeatureProfile {
        FeatureProfile {
            type_id,
            feature_map: 0,
            attributes: attributes.to_vec(),
            commands: commands.to_vec(),
            values: BTreeMap::new(),
        }
    }

    fn endpoint(kind: u8, features: Vec<FeatureProfile>) -> EndpointProfile {
        EndpointProfile {
            id: 1,
            kind,
            features,
        }
    }

    fn scenario(name: &str, bit: u8, features: Vec<FeatureRequirement>) -> ScenarioDef {
        ScenarioDef {
            name: name.to_string(),
            bit,
            ..Default::default()
        }
        .with_features(features)
    }

    impl ScenarioDef {
        fn with_features(mut self, features: Vec<FeatureRequirement>) -> Self {
            self.features = features;
            self
        }

        fn requires(mut self, names: &[&str]) -> Self {
            self.requires = names.iter().map(|it| it.to_string()).collect();
            self
        }

        fn requires_any(mut self, names: &[&str]) -> Self {
            self.requires_any = names.iter().map(|it| it.to_string()).collect();
            self
        }
    }

    fn measurement_requirement() -> FeatureRequirement {
        FeatureRequirement {
            feature_type: FEATURE_MEASUREMENT,
            attributes: vec![1],
            ..Default::default()
        }
    }

    fn limits_requirement() -> FeatureRequirement {
        FeatureRequirement {
            feature_type: FEATURE_LIMITS,
            commands: vec![1],
            ..Default::default()
        }
    }

    #[test]
    fn feature_requirements_gate_scenarios() {
        let registry = vec![UseCaseDef {
            name: "monitoring".to_string(),
            endpoint_types: vec![ENDPOINT_TYPE_EV_CHARGER],
            scenarios: vec![
                scenario("base", 0, vec![measurement_requirement()]),
                scenario("control", 1, vec![limits_requirement()]),
            ],
        }];

        let profile = DeviceProfile {
            endpoints: vec![endpoint(
                ENDPOINT_TYPE_EV_CHARGER,
                vec![feature(FEATURE_MEASUREMENT, &[1, 2], &[])],
            )],
        };

        let result = match_profile(&profile, &registry);
        assert_eq!(result.use_cases["monitoring"], 0b01);
        assert_eq!(result.endpoint_for_use_case["monitoring"], 1);
    }

    #[test]
    fn endpoint_type_filter_excludes_the_use_case() {
        let registry = vec![UseCaseDef {
            name: "monitoring".to_string(),
            endpoint_types: vec![ENDPOINT_TYPE_INVERTER],
            scenarios: vec![scenario("base", 0, vec![measurement_requirement()])],
        }];

        let profile = DeviceProfile {
            endpoints: vec![endpoint(
                ENDPOINT_TYPE_EV_CHARGER,
                vec![feature(FEATURE_MEASUREMENT, &[1], &[])],
            )],
        };

        assert!(match_profile(&profile, &registry).use_cases.is_empty());
    }

    #[test]
    fn predicate_must_match_captured_value() {
        let mut with_limits = feature(FEATURE_LIMITS, &[7], &[1]);
        with_limits
            .values
            .insert(7, Value::Bool(false));

        let registry = vec![UseCaseDef {
            name: "control".to_string(),
            endpoint_types: vec![],
            scenarios: vec![scenario(
                "limits",
                0,
                vec![FeatureRequirement {
                    feature_type: FEATURE_LIMITS,
                    predicates: vec![AttributePredicate {
                        attribute: 7,
                        equals: Value::Bool(true),
                    }],
                    ..Default::default()
                }],
            )],
        }];

        let profile = DeviceProfile {
            endpoints: vec![endpoint(ENDPOINT_TYPE_EV_CHARGER, vec![with_limits])],
        };

        assert!(match_profile(&profile, &registry).use_cases.is_empty());
    }

    #[test]
    fn requires_chain_resolves_to_fixpoint() {
        // S2 needs S1, S1 needs BASE; BASE's features are absent, so
        // the whole chain collapses over two rounds.
        let registry = vec![UseCaseDef {
            name: "chain".to_string(),
            endpoint_types: vec![],
            scenarios: vec![
                scenario("base", 0, vec![limits_requirement()]),
                scenario("s1", 1, vec![measurement_requirement()]).requires(&["base"]),
                scenario("s2", 2, vec![measurement_requirement()]).requires(&["s1"]),
            ],
        }];

        let profile = DeviceProfile {
            endpoints: vec![endpoint(
                ENDPOINT_TYPE_EV_CHARGER,
                vec![feature(FEATURE_MEASUREMENT, &[1], &[])],
            )],
        };

        assert!(match_profile(&profile, &registry).use_cases.is_empty());
    }

    #[test]
    fn mutual_constraints_collapse_to_empty() {
        // BASE requires any of {A, B}; A requires BASE. Only A's
        // features are present: A falls (no BASE), and BASE never
        // stood.
        let registry = vec![UseCaseDef {
            name: "mutual".to_string(),
            endpoint_types: vec![],
            scenarios: vec![
                scenario("base", 0, vec![limits_requirement()]).requires_any(&["a", "b"]),
                scenario("a", 1, vec![measurement_requirement()]).requires(&["base"]),
            ],
        }];

        let profile = DeviceProfile {
            endpoints: vec![endpoint(
                ENDPOINT_TYPE_EV_CHARGER,
                vec![feature(FEATURE_MEASUREMENT, &[1], &[])],
            )],
        };

        assert!(match_profile(&profile, &registry).use_cases.is_empty());
    }

    #[test]
    fn union_across_endpoints_records_first_match() {
        let registry = vec![UseCaseDef {
            name: "monitoring".to_string(),
            endpoint_types: vec![],
            scenarios: vec![
                scenario("base", 0, vec![measurement_requirement()]),
                scenario("control", 1, vec![limits_requirement()]),
            ],
        }];

        let profile = DeviceProfile {
            endpoints: vec![
                EndpointProfile {
                    id: 1,
                    kind: ENDPOINT_TYPE_EV_CHARGER,
                    features: vec![feature(FEATURE_MEASUREMENT, &[1], &[])],
                },
                EndpointProfile {
                    id: 2,
                    kind: ENDPOINT_TYPE_EV_CHARGER,
                    features: vec![feature(FEATURE_LIMITS, &[], &[1])],
                },
            ],
        };

        let result = match_profile(&profile, &registry);
        assert_eq!(result.use_cases["monitoring"], 0b11);
        assert_eq!(result.endpoint_for_use_case["monitoring"], 1);
    }
}
