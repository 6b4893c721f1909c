//! Parsing constraints out of labels and environment keys, and merging
//! affinity labels.

use super::constraint::{AffinityOp, Constraint, ConstraintDefinition};
use crate::labels::{
    Labels, ENV_HEADER_AFFINITY_CONTAINER, ENV_HEADER_AFFINITY_CONTAINER_LABEL, ENV_HEADER_AFFINITY_HOST_LABEL,
    LABEL_AFFINITY_NAMESPACE, LABEL_HEADER_AFFINITY_CONTAINER, LABEL_HEADER_AFFINITY_CONTAINER_LABEL,
    LABEL_HEADER_AFFINITY_HOST_LABEL, LABEL_STACK_NAME, LABEL_STACK_SERVICE_NAME, PROJECT_NAME_MACRO,
    SERVICE_NAME_MACRO, STACK_NAME_MACRO,
};
use crate::state::Instance;

#[derive(Clone, Copy)]
enum Kind {
    Host,
    Container,
    ContainerLabel,
}

impl Kind {
    const fn build(self, def: ConstraintDefinition) -> Constraint {
        match self {
            Self::Host => Constraint::HostAffinity(def),
            Self::Container => Constraint::ContainerAffinity(def),
            Self::ContainerLabel => Constraint::ContainerLabelAffinity(def),
        }
    }

    const fn keyed(self) -> bool {
        !matches!(self, Self::Container)
    }
}

/// Extracts constraints from scheduler labels.
///
/// Keys and values are compared lowercased. Values are comma-separated; the
/// label-keyed kinds take `key=value` items split on the first `=`. When an
/// owning instance is given, `${stack_name}`, `${project_name}` and
/// `${service_name}` are substituted from its own labels first. Unknown
/// prefixes and malformed items are skipped.
#[must_use]
pub fn extract_constraints_from_labels(labels: &Labels, instance: Option<&Instance>) -> Vec<Constraint> {
    let mut entries: Vec<(&String, &String)> = labels.iter().collect();
    entries.sort();

    let mut constraints = Vec::new();
    for (key, value) in entries {
        let key = key.to_lowercase();
        let mut value = value.to_lowercase();
        if let Some(instance) = instance {
            value = evaluate_macros(&value, instance);
        }

        // container_label must be tried before its container prefix
        let (kind, suffix) = if let Some(rest) = key.strip_prefix(LABEL_HEADER_AFFINITY_CONTAINER_LABEL) {
            (Kind::ContainerLabel, rest)
        } else if let Some(rest) = key.strip_prefix(LABEL_HEADER_AFFINITY_CONTAINER) {
            (Kind::Container, rest)
        } else if let Some(rest) = key.strip_prefix(LABEL_HEADER_AFFINITY_HOST_LABEL) {
            (Kind::Host, rest)
        } else {
            continue;
        };

        let Some(op) = AffinityOp::from_label_suffix(suffix) else {
            continue;
        };

        for item in value.split(',').filter(|v| !v.is_empty()) {
            let def = if kind.keyed() {
                match item.split_once('=') {
                    Some((k, v)) if !k.is_empty() && !v.is_empty() => ConstraintDefinition::new(op, Some(k), v),
                    _ => continue,
                }
            } else {
                ConstraintDefinition::new(op, None, item)
            };
            constraints.push(kind.build(def));
        }
    }
    constraints
}

/// Extracts constraints from environment keys such as
/// `constraint:region==west`, `affinity:container!=db` or
/// `affinity:tier==~web`.
///
/// The operator is the first of [`AffinityOp::ALL`] whose symbol occurs in
/// the key. Malformed keys are skipped.
#[must_use]
pub fn extract_constraints_from_env(env: &Labels) -> Vec<Constraint> {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();

    let mut constraints = Vec::new();
    for key in keys {
        if let Some(rest) = key.strip_prefix(ENV_HEADER_AFFINITY_CONTAINER) {
            if let Some((op, "", value)) = parse_env_definition(rest) {
                if !value.is_empty() {
                    constraints.push(Kind::Container.build(ConstraintDefinition::new(op, None, value)));
                }
                continue;
            }
        }

        let (kind, rest) = if let Some(rest) = key.strip_prefix(ENV_HEADER_AFFINITY_CONTAINER_LABEL) {
            (Kind::ContainerLabel, rest)
        } else if let Some(rest) = key.strip_prefix(ENV_HEADER_AFFINITY_HOST_LABEL) {
            (Kind::Host, rest)
        } else {
            continue;
        };

        if let Some((op, k, v)) = parse_env_definition(rest) {
            if !k.is_empty() && !v.is_empty() {
                constraints.push(kind.build(ConstraintDefinition::new(op, Some(k), v)));
            }
        }
    }
    constraints
}

fn parse_env_definition(definition: &str) -> Option<(AffinityOp, &str, &str)> {
    AffinityOp::ALL.into_iter().find_map(|op| {
        definition
            .find(op.env_symbol())
            .map(|i| (op, &definition[..i], &definition[i + op.env_symbol().len()..]))
    })
}

fn evaluate_macros(value: &str, instance: &Instance) -> String {
    if ![SERVICE_NAME_MACRO, STACK_NAME_MACRO, PROJECT_NAME_MACRO]
        .iter()
        .any(|m| value.contains(m))
    {
        return value.to_string();
    }

    let stack_name = instance.labels.get(LABEL_STACK_NAME).map_or("", String::as_str);
    let service_name = instance
        .labels
        .get(LABEL_STACK_SERVICE_NAME)
        .and_then(|v| v.split_once('/'))
        .map_or("", |(_, service)| service);

    let mut value = value.to_string();
    if !stack_name.trim().is_empty() {
        value = value
            .replace(STACK_NAME_MACRO, stack_name)
            .replace(PROJECT_NAME_MACRO, stack_name);
    }
    if !service_name.trim().is_empty() {
        value = value.replace(SERVICE_NAME_MACRO, service_name);
    }
    value
}

/// Merges `src` into `dest`.
///
/// Affinity keys are unioned: a source value is appended with a comma unless
/// the destination already contains it, ignoring case. Other keys are
/// overwritten. Keys are lowercased. Does nothing if either map is absent.
pub fn merge_labels(src: Option<&Labels>, dest: Option<&mut Labels>) {
    let (Some(src), Some(dest)) = (src, dest) else {
        return;
    };

    for (key, value) in src {
        let key = key.to_lowercase();
        if !key.starts_with(LABEL_AFFINITY_NAMESPACE) {
            dest.insert(key, value.clone());
            continue;
        }

        match dest.get(&key) {
            Some(existing) if !existing.is_empty() => {
                if !value.is_empty() && !existing.to_lowercase().contains(&value.to_lowercase()) {
                    let merged = format!("{existing},{value}");
                    dest.insert(key, merged);
                }
            }
            _ => {
                dest.insert(key, value.clone());
            }
        }
    }
}
