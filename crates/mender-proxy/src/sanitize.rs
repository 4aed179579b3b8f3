//! Recursive removal of fields the relay does not understand.
//!
//! The relay rejects `cache_control` wherever it appears (message, content
//! block, tool result, system block, tool definition). Rather than knowing
//! every place a client may attach one, the whole body is walked and every
//! object has the stripped keys removed.

use crate::config::Policy;
use crate::error::PipelineError;
use serde_json::{Map, Value};

/// Callback for [`walk_mut`].
pub trait ValueVisitor {
    /// Called for every object, before its values are walked.
    fn visit_object(&mut self, object: &mut Map<String, Value>);

    /// Called for every array, before its items are walked.
    fn visit_array(&mut self, _array: &mut Vec<Value>) {}
}

/// Depth-first walk over a JSON tree, mutating it through `visitor`.
///
/// The root container sits at depth 1. A container nested deeper than
/// `max_depth` aborts the walk with [`PipelineError::DepthExceeded`]; the tree
/// may then be partially visited and must be discarded.
pub fn walk_mut<V: ValueVisitor + ?Sized>(
    value: &mut Value,
    visitor: &mut V,
    max_depth: usize,
) -> Result<(), PipelineError> {
    walk_at(value, visitor, 1, max_depth)
}

fn walk_at<V: ValueVisitor + ?Sized>(
    value: &mut Value,
    visitor: &mut V,
    depth: usize,
    max_depth: usize,
) -> Result<(), PipelineError> {
    match value {
        Value::Object(obj) => {
            if depth > max_depth {
                return Err(PipelineError::DepthExceeded { limit: max_depth });
            }
            visitor.visit_object(obj);
            for (_k, v) in obj.iter_mut() {
                walk_at(v, visitor, depth + 1, max_depth)?;
            }
        }
        Value::Array(arr) => {
            if depth > max_depth {
                return Err(PipelineError::DepthExceeded { limit: max_depth });
            }
            visitor.visit_array(arr);
            for item in arr.iter_mut() {
                walk_at(item, visitor, depth + 1, max_depth)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Reject raw JSON nested deeper than `max_depth` without parsing it.
///
/// Depth is counted the way [`walk_mut`] counts it. Brackets inside strings
/// are ignored; malformed input is left for the parser to report.
pub fn check_nesting(body: &[u8], max_depth: usize) -> Result<(), PipelineError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for &byte in body {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                if depth > max_depth {
                    return Err(PipelineError::DepthExceeded { limit: max_depth });
                }
            }
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

/// Removes a fixed set of keys from every object it visits.
pub struct FieldStripper<'a> {
    fields: &'a [String],
    removed: usize,
}

impl<'a> FieldStripper<'a> {
    pub fn new(fields: &'a [String]) -> Self {
        Self { fields, removed: 0 }
    }

    pub fn removed(&self) -> usize {
        self.removed
    }
}

impl ValueVisitor for FieldStripper<'_> {
    fn visit_object(&mut self, object: &mut Map<String, Value>) {
        let before = object.len();
        object.retain(|k, _| !self.fields.iter().any(|f| f == k));
        self.removed += before - object.len();
    }
}

/// Strip the policy's fields at every depth. Returns how many were removed.
pub fn sanitize(value: &mut Value, policy: &Policy) -> Result<usize, PipelineError> {
    let mut stripper = FieldStripper::new(&policy.stripped_fields);
    walk_mut(value, &mut stripper, policy.max_depth)?;
    if stripper.removed() > 0 {
        tracing::debug!(removed = stripper.removed(), "stripped annotation fields");
    }
    Ok(stripper.removed())
}
