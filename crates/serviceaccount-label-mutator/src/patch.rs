//! JSON Patch (RFC 6902) construction for label mutations.
use std::collections::BTreeMap;

use json_patch::{AddOperation, Patch, PatchOperation, jsonptr::PointerBuf};
use serde_json::Value;

/// Builds the `add` operations needed to set labels on an object whose
/// current labels are known.
///
/// When the object has no labels, the first operation creates an empty
/// `/metadata/labels` map, so that every following operation has an existing
/// parent. Label keys are escaped as JSON Pointer tokens (`/` becomes `~1`,
/// `~` becomes `~0`).
///
/// ```
/// use std::collections::BTreeMap;
/// use serviceaccount_label_mutator::patch::LabelPatchBuilder;
///
/// let labels = BTreeMap::new();
/// let patch = LabelPatchBuilder::new(&labels)
///     .add_label("azure.workload.identity/client-id", "abc-123")
///     .build()
///     .expect("the label is new");
///
/// assert_eq!(
///     serde_json::to_string(&patch).unwrap(),
///     r#"[{"op":"add","path":"/metadata/labels","value":{}},{"op":"add","path":"/metadata/labels/azure.workload.identity~1client-id","value":"abc-123"}]"#
/// );
/// ```
#[derive(Debug)]
pub struct LabelPatchBuilder<'a> {
    current: &'a BTreeMap<String, String>,
    operations: Vec<PatchOperation>,
}

impl<'a> LabelPatchBuilder<'a> {
    pub fn new(current: &'a BTreeMap<String, String>) -> Self {
        Self {
            current,
            operations: Vec::new(),
        }
    }

    /// Sets `key` to `value`. Does nothing if the label already has that
    /// value.
    pub fn add_label(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        let key = key.as_ref();
        let value = value.into();

        if self.current.get(key) == Some(&value) {
            return self;
        }

        if self.current.is_empty() && self.operations.is_empty() {
            self.operations.push(PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "labels"]),
                value: Value::Object(serde_json::Map::new()),
            }));
        }

        self.operations.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "labels", key]),
            value: Value::String(value),
        }));

        self
    }

    /// Returns the patch, or [`None`] if it would not change the object.
    pub fn build(self) -> Option<Patch> {
        if self.operations.is_empty() {
            None
        } else {
            Some(Patch(self.operations))
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn labels(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[rstest]
    #[case("app", "/metadata/labels/app")]
    #[case("example.com/team", "/metadata/labels/example.com~1team")]
    #[case("odd~key", "/metadata/labels/odd~0key")]
    fn escapes_label_keys(#[case] key: &str, #[case] expected_path: &str) {
        let current = labels(&[("existing", "label")]);
        let patch = LabelPatchBuilder::new(&current)
            .add_label(key, "value")
            .build()
            .unwrap();

        let operations = serde_json::to_value(&patch).unwrap();
        assert_eq!(
            operations,
            json!([{"op": "add", "path": expected_path, "value": "value"}])
        );
    }

    #[test]
    fn creates_labels_map_first_when_absent() {
        let current = BTreeMap::new();
        let patch = LabelPatchBuilder::new(&current)
            .add_label("first", "1")
            .add_label("second", "2")
            .build()
            .unwrap();

        let mut object = json!({"metadata": {"name": "default"}});
        json_patch::patch(&mut object, &patch).unwrap();

        assert_eq!(
            object,
            json!({"metadata": {"name": "default", "labels": {"first": "1", "second": "2"}}})
        );
        assert_eq!(patch.0.len(), 3);
    }

    #[test]
    fn keeps_existing_labels() {
        let current = labels(&[("app", "demo")]);
        let patch = LabelPatchBuilder::new(&current)
            .add_label("team", "platform")
            .build()
            .unwrap();

        let mut object = json!({"metadata": {"labels": {"app": "demo"}}});
        json_patch::patch(&mut object, &patch).unwrap();

        assert_eq!(
            object,
            json!({"metadata": {"labels": {"app": "demo", "team": "platform"}}})
        );
    }

    #[test]
    fn unchanged_label_produces_no_patch() {
        let current = labels(&[("team", "platform")]);
        let patch = LabelPatchBuilder::new(&current)
            .add_label("team", "platform")
            .build();

        assert!(patch.is_none());
    }

    #[test]
    fn changed_label_is_overwritten() {
        let current = labels(&[("team", "platform")]);
        let patch = LabelPatchBuilder::new(&current)
            .add_label("team", "storage")
            .build()
            .unwrap();

        let mut object = json!({"metadata": {"labels": {"team": "platform"}}});
        json_patch::patch(&mut object, &patch).unwrap();

        assert_eq!(object, json!({"metadata": {"labels": {"team": "storage"}}}));
    }
}
