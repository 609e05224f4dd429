//! Deciding what to do with each managed resource
//!
//! Only the fields the operator sets are compared. A live object "matches"
//! when it contains everything the desired object specifies; defaults filled
//! in by the platform and fields owned by others are ignored.

use std::fmt;

use kube::api::DynamicObject;
use serde_json::Value;

use crate::model::DesiredResource;
use crate::resource::{self, ResourceKind};

/// What happens to one resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Resource is missing and is created
    Create,
    /// Resource exists but differs
    UpdateInPlace,
    /// Resource exists and must not
    Delete,
    /// Nothing to do
    Noop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::UpdateInPlace => "update",
            Action::Delete => "delete",
            Action::Noop => "noop",
        })
    }
}

/// Replica change issued after the object itself is up to date
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleStep {
    /// Scale up to the target replica count
    Up(i32),
    /// Scale down to the target replica count
    Down(i32),
}

/// The decision for one resource
#[derive(Clone, Debug)]
pub struct ResourcePlan {
    /// Kind
    pub kind: ResourceKind,
    /// Name
    pub name: String,
    /// Action on the object
    pub action: Action,
    /// Replica change after the action
    pub scale: Option<ScaleStep>,
    /// Object to apply for create or update
    pub object: Option<DynamicObject>,
}

impl ResourcePlan {
    /// Whether applying the plan changes anything
    pub fn is_noop(&self) -> bool {
        self.action == Action::Noop && self.scale.is_none()
    }
}

/// Compare desired against live state
pub fn plan(desired: &DesiredResource, live: Option<&DynamicObject>) -> ResourcePlan {
    let mut plan = ResourcePlan {
        kind: desired.kind,
        name: desired.name.clone(),
        action: Action::Noop,
        scale: None,
        object: None,
    };

    match (&desired.object, live) {
        (None, None) => {}
        (None, Some(_)) => plan.action = Action::Delete,
        (Some(object), None) => {
            plan.action = Action::Create;
            plan.object = Some(object.clone());
        }
        (Some(object), Some(live)) => {
            let desired_replicas = resource::replicas(object);
            let live_replicas = resource::replicas(live);

            let mut pinned = object.clone();
            if desired.kind.is_scalable() {
                if let (Some(want), Some(have)) = (desired_replicas, live_replicas) {
                    pin_replicas(&mut pinned, have);
                    plan.scale = match want.cmp(&have) {
                        std::cmp::Ordering::Greater => Some(ScaleStep::Up(want)),
                        std::cmp::Ordering::Less => Some(ScaleStep::Down(want)),
                        std::cmp::Ordering::Equal => None,
                    };
                }
            }

            if !matches(&pinned, live) {
                plan.action = Action::UpdateInPlace;
                plan.object = Some(pinned);
            }
        }
    }
    plan
}

fn pin_replicas(object: &mut DynamicObject, replicas: i32) {
    if let Some(spec) = object.data.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("replicas".to_string(), Value::from(replicas));
    }
}

/// Whether `live` carries everything `desired` specifies
pub fn matches(desired: &DynamicObject, live: &DynamicObject) -> bool {
    let labels_match = match &desired.metadata.labels {
        None => true,
        Some(want) => live
            .metadata
            .labels
            .as_ref()
            .is_some_and(|have| want.iter().all(|(k, v)| have.get(k) == Some(v))),
    };
    let annotations_match = match &desired.metadata.annotations {
        None => true,
        Some(want) => live
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|have| want.iter().all(|(k, v)| have.get(k) == Some(v))),
    };
    labels_match && annotations_match && data_matches(&desired.data, &live.data)
}

fn data_matches(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .filter(|(k, _)| k.as_str() != "status")
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        _ => is_subset(desired, live),
    }
}

/// Recursive containment: every field in `desired` is present and equal in
/// `live`; arrays must have equal length and match element-wise.
pub fn is_subset(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (Value::Number(want), Value::Number(have)) => {
            want == have || (want.as_f64().is_some() && want.as_f64() == have.as_f64())
        }
        _ => desired == live,
    }
}
