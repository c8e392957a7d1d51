//! Schema-validating decoder for batch documents.
//!
//! The payload comes from untrusted fuzzer hosts, so decoding walks a
//! `serde_json::Value` by hand instead of deriving `Deserialize`. That keeps
//! the error taxonomy precise: a missing key, a wrong JSON type, an unknown
//! entry type and a bad integer are all distinguishable, and every error names
//! the offending field by path (`entries[3].state[0].expected`).
//!
//! Fields are checked in document order: `fuzzer-host`, `fuzzer-user`,
//! `testing-host`, `arch`, `entries`; then per entry `type`, `opcode` and the
//! kind-specific fields. The first problem found is reported. Unknown extra
//! fields are ignored.
//!
//! Decoding is pure: no I/O, no clocks, no randomness.

use fm_common::{IngestError, Result};
use serde_json::{Map, Value};

use super::{
    Batch, BatchEntry, EntryKind, FailureEntry, Input, SignalEntry, StateValue, SuccessEntry,
};

/// Decode raw request bytes into a [`Batch`].
pub fn parse_batch(raw: &[u8]) -> Result<Batch> {
    let text = std::str::from_utf8(raw).map_err(|e| {
        IngestError::MalformedDocument(format!("body is not valid UTF-8: {}", e))
    })?;
    let value: Value = serde_json::from_str(text)
        .map_err(|e| IngestError::MalformedDocument(e.to_string()))?;
    parse_document(&value)
}

/// Decode an already-parsed JSON document into a [`Batch`].
pub fn parse_document(value: &Value) -> Result<Batch> {
    let doc = Object::new(value, String::new())?;

    let fuzzer_host = doc.string("fuzzer-host")?;
    let fuzzer_user = doc.string("fuzzer-user")?;
    let testing_host = doc.string("testing-host")?;
    let arch = doc.string("arch")?;

    let entries = doc
        .objects("entries")?
        .iter()
        .map(parse_entry)
        .collect::<Result<Vec<_>>>()?;

    Ok(Batch {
        fuzzer_host,
        fuzzer_user,
        testing_host,
        arch,
        entries,
    })
}

fn parse_entry(entry: &Object<'_>) -> Result<BatchEntry> {
    let tag = entry.string("type")?;
    let opcode = entry.string("opcode")?;

    match EntryKind::from_tag(&tag) {
        Some(EntryKind::Success) => {
            let count = entry.integer("count")?;
            let count = u64::try_from(count).map_err(|_| {
                IngestError::invalid_value(
                    entry.path_of("count"),
                    format!("count must be non-negative, got {}", count),
                )
            })?;
            Ok(BatchEntry::Success(SuccessEntry { opcode, count }))
        }
        Some(EntryKind::Failure) => {
            let raw_operands = entry.string("raw-operands")?;
            let pretty = entry.string("pretty")?;
            let bytes = entry.string("bytes")?;
            let state = entry
                .objects("state")?
                .iter()
                .map(|sval| {
                    Ok(StateValue {
                        location: sval.string("location")?,
                        expected: sval.string("expected")?,
                        actual: sval.string("actual")?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let inputs = parse_inputs(entry)?;
            Ok(BatchEntry::Failure(FailureEntry {
                opcode,
                raw_operands,
                pretty,
                bytes,
                state,
                inputs,
            }))
        }
        Some(EntryKind::UnexpectedSignal) => {
            let pretty = entry.string("pretty")?;
            let bytes = entry.string("bytes")?;
            let signal = entry.integer("signal")?;
            let inputs = parse_inputs(entry)?;
            Ok(BatchEntry::UnexpectedSignal(SignalEntry {
                opcode,
                pretty,
                bytes,
                signal,
                inputs,
            }))
        }
        None => Err(IngestError::InvalidEntryType(tag)),
    }
}

fn parse_inputs(entry: &Object<'_>) -> Result<Vec<Input>> {
    entry
        .objects("inputs")?
        .iter()
        .map(|ival| {
            Ok(Input {
                location: ival.string("location")?,
                value: ival.string("value")?,
            })
        })
        .collect()
}

/// A JSON object together with its path from the document root.
struct Object<'a> {
    fields: &'a Map<String, Value>,
    path: String,
}

impl<'a> Object<'a> {
    fn new(value: &'a Value, path: String) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Object { fields, path }),
            other => {
                let field = if path.is_empty() {
                    "document".to_string()
                } else {
                    path
                };
                Err(IngestError::type_mismatch(field, "an object", json_type(other)))
            }
        }
    }

    fn path_of(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        }
    }

    fn required(&self, name: &str) -> Result<&'a Value> {
        self.fields
            .get(name)
            .ok_or_else(|| IngestError::MissingField(self.path_of(name)))
    }

    fn string(&self, name: &str) -> Result<String> {
        match self.required(name)? {
            Value::String(s) => Ok(s.clone()),
            other => Err(IngestError::type_mismatch(
                self.path_of(name),
                "a string",
                json_type(other),
            )),
        }
    }

    fn integer(&self, name: &str) -> Result<i64> {
        integer_value(self.required(name)?, &self.path_of(name))
    }

    /// A required array whose every element must be an object.
    fn objects(&self, name: &str) -> Result<Vec<Object<'a>>> {
        let field = self.path_of(name);
        match self.required(name)? {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| Object::new(item, format!("{}[{}]", field, i)))
                .collect(),
            other => Err(IngestError::type_mismatch(field, "an array", json_type(other))),
        }
    }
}

/// Integers arrive either as JSON numbers or as decimal strings.
fn integer_value(value: &Value, field: &str) -> Result<i64> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                return Ok(v);
            }
            if n.as_u64().is_some() {
                return Err(IngestError::invalid_value(
                    field,
                    format!("{} is out of range", n),
                ));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    Ok(f as i64)
                }
                Some(f) if f.fract() == 0.0 => Err(IngestError::invalid_value(
                    field,
                    format!("{} is out of range", n),
                )),
                _ => Err(IngestError::invalid_value(
                    field,
                    format!("expected an integer, got {}", n),
                )),
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| {
            IngestError::invalid_value(field, format!("expected an integer, got {:?}", s))
        }),
        other => Err(IngestError::type_mismatch(
            field,
            "an integer",
            json_type(other),
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with(entries: Value) -> Value {
        json!({
            "fuzzer-host": "fh1",
            "fuzzer-user": "u1",
            "testing-host": "th1",
            "arch": "x86",
            "entries": entries,
        })
    }

    fn parse_value(value: Value) -> Result<Batch> {
        parse_batch(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn parses_success_entry_with_string_count() {
        let batch =
            parse_value(doc_with(json!([{"type": "success", "opcode": "ADD", "count": "5"}])))
                .unwrap();
        assert_eq!(batch.fuzzer_host, "fh1");
        assert_eq!(batch.fuzzer_user, "u1");
        assert_eq!(batch.testing_host, "th1");
        assert_eq!(batch.arch, "x86");
        assert_eq!(
            batch.entries,
            vec![BatchEntry::Success(SuccessEntry {
                opcode: "ADD".into(),
                count: 5
            })]
        );
    }

    #[test]
    fn parses_numeric_and_padded_counts() {
        let batch = parse_value(doc_with(json!([
            {"type": "success", "opcode": "ADD", "count": 7},
            {"type": "success", "opcode": "SUB", "count": " 12 "},
            {"type": "success", "opcode": "MUL", "count": 3.0},
        ])))
        .unwrap();
        let counts: Vec<u64> = batch
            .entries
            .iter()
            .map(|e| match e {
                BatchEntry::Success(s) => s.count,
                other => panic!("unexpected entry {:?}", other),
            })
            .collect();
        assert_eq!(counts, vec![7, 12, 3]);
    }

    #[test]
    fn parses_failure_entry_with_children_in_order() {
        let batch = parse_value(doc_with(json!([{
            "type": "failure",
            "opcode": "ADD",
            "raw-operands": "(r1, r2)",
            "pretty": "add r1, r2",
            "bytes": "00c4",
            "state": [
                {"location": "r1", "expected": "3", "actual": "4"},
                {"location": "cr0", "expected": "0", "actual": "8"},
            ],
            "inputs": [
                {"location": "r1", "value": "1"},
                {"location": "r2", "value": "2"},
                {"location": "cr0", "value": "0"},
            ],
        }])))
        .unwrap();

        let BatchEntry::Failure(failure) = &batch.entries[0] else {
            panic!("expected failure entry");
        };
        assert_eq!(failure.raw_operands, "(r1, r2)");
        assert_eq!(failure.state.len(), 2);
        assert_eq!(failure.state[1].location, "cr0");
        assert_eq!(failure.inputs.len(), 3);
        assert_eq!(failure.inputs[2].value, "0");
    }

    #[test]
    fn parses_signal_entry() {
        let batch = parse_value(doc_with(json!([{
            "type": "unexpectedSignal",
            "opcode": "LDR",
            "pretty": "ldr r0, [r1]",
            "bytes": "e5910000",
            "signal": 11,
            "inputs": [{"location": "r1", "value": "0"}],
        }])))
        .unwrap();
        let BatchEntry::UnexpectedSignal(sig) = &batch.entries[0] else {
            panic!("expected signal entry");
        };
        assert_eq!(sig.signal, 11);
        assert_eq!(sig.inputs.len(), 1);
    }

    #[test]
    fn empty_entries_are_allowed() {
        let batch = parse_value(doc_with(json!([]))).unwrap();
        assert!(batch.entries.is_empty());
    }

    #[test]
    fn extra_fields_are_ignored() {
        let mut doc = doc_with(json!([{"type": "success", "opcode": "ADD", "count": 1, "note": "x"}]));
        doc["client-version"] = json!("1.2.3");
        assert!(parse_value(doc).is_ok());
    }

    #[test]
    fn missing_top_level_fields_are_reported_in_order() {
        for field in ["fuzzer-host", "fuzzer-user", "testing-host", "arch", "entries"] {
            let mut doc = doc_with(json!([]));
            doc.as_object_mut().unwrap().remove(field);
            assert_eq!(
                parse_value(doc).unwrap_err(),
                IngestError::MissingField(field.to_string())
            );
        }

        let err = parse_value(json!({})).unwrap_err();
        assert_eq!(err, IngestError::MissingField("fuzzer-host".into()));
    }

    #[test]
    fn missing_entry_fields_carry_paths() {
        let err = parse_value(doc_with(json!([
            {"type": "success", "opcode": "ADD", "count": 1},
            {"type": "success", "opcode": "ADD"},
        ])))
        .unwrap_err();
        assert_eq!(err, IngestError::MissingField("entries[1].count".into()));

        let err = parse_value(doc_with(json!([{
            "type": "failure", "opcode": "ADD", "raw-operands": "", "pretty": "",
            "bytes": "", "state": [{"location": "r1", "expected": "1"}], "inputs": [],
        }])))
        .unwrap_err();
        assert_eq!(
            err,
            IngestError::MissingField("entries[0].state[0].actual".into())
        );
    }

    #[test]
    fn opcode_is_checked_before_entry_type() {
        let err = parse_value(doc_with(json!([{"type": "bogus"}]))).unwrap_err();
        assert_eq!(err, IngestError::MissingField("entries[0].opcode".into()));
    }

    #[test]
    fn unknown_entry_type_is_rejected() {
        let err =
            parse_value(doc_with(json!([{"type": "timeout", "opcode": "ADD"}]))).unwrap_err();
        assert_eq!(err, IngestError::InvalidEntryType("timeout".into()));
        assert!(err.user_message().starts_with("Invalid value:"));
    }

    #[test]
    fn non_integer_count_is_invalid_value() {
        let err = parse_value(doc_with(json!([
            {"type": "success", "opcode": "ADD", "count": "not-a-number"}
        ])))
        .unwrap_err();
        assert!(matches!(
            &err,
            IngestError::InvalidValue { field, .. } if field == "entries[0].count"
        ));
        assert!(err.user_message().starts_with("Invalid value: "));

        let err = parse_value(doc_with(json!([
            {"type": "success", "opcode": "ADD", "count": 2.5}
        ])))
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidValue { .. }));
    }

    #[test]
    fn negative_count_is_invalid_value() {
        let err = parse_value(doc_with(json!([
            {"type": "success", "opcode": "ADD", "count": -1}
        ])))
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidValue { .. }));
    }

    #[test]
    fn oversized_integer_is_out_of_range() {
        let err = parse_batch(
            br#"{"fuzzer-host":"a","fuzzer-user":"b","testing-host":"c","arch":"d",
                "entries":[{"type":"success","opcode":"ADD","count":18446744073709551615}]}"#,
        )
        .unwrap_err();
        match err {
            IngestError::InvalidValue { reason, .. } => assert!(reason.contains("out of range")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn wrong_json_types_are_type_mismatches() {
        let err = parse_value(json!({
            "fuzzer-host": 1, "fuzzer-user": "u", "testing-host": "t", "arch": "a", "entries": []
        }))
        .unwrap_err();
        assert_eq!(
            err,
            IngestError::type_mismatch("fuzzer-host", "a string", "a number")
        );

        let mut doc = doc_with(json!("nope"));
        let err = parse_value(doc.clone()).unwrap_err();
        assert_eq!(err, IngestError::type_mismatch("entries", "an array", "a string"));

        doc["entries"] = json!([42]);
        let err = parse_value(doc.clone()).unwrap_err();
        assert_eq!(err, IngestError::type_mismatch("entries[0]", "an object", "a number"));

        doc["entries"] = json!([{"type": "success", "opcode": "ADD", "count": null}]);
        let err = parse_value(doc.clone()).unwrap_err();
        assert_eq!(
            err,
            IngestError::type_mismatch("entries[0].count", "an integer", "null")
        );
        assert!(err.user_message().starts_with("Type error: "));

        doc["entries"] = json!([{"type": "unexpectedSignal", "opcode": "X", "pretty": "",
            "bytes": "", "signal": 11, "inputs": {}}]);
        let err = parse_value(doc).unwrap_err();
        assert_eq!(
            err,
            IngestError::type_mismatch("entries[0].inputs", "an array", "an object")
        );
    }

    #[test]
    fn non_object_document_is_type_mismatch() {
        let err = parse_batch(b"[1, 2, 3]").unwrap_err();
        assert_eq!(err, IngestError::type_mismatch("document", "an object", "an array"));
    }

    #[test]
    fn malformed_documents() {
        assert!(matches!(
            parse_batch(b"{not json").unwrap_err(),
            IngestError::MalformedDocument(_)
        ));
        assert!(matches!(
            parse_batch(b"").unwrap_err(),
            IngestError::MalformedDocument(_)
        ));
        assert!(matches!(
            parse_batch(&[0xff, 0xfe, b'{', b'}']).unwrap_err(),
            IngestError::MalformedDocument(_)
        ));
    }

    #[test]
    fn serialize_then_parse_roundtrips() {
        let decoded = parse_value(doc_with(json!([
            {"type": "success", "opcode": "ADD", "count": "5"},
            {"type": "unexpectedSignal", "opcode": "LDR", "pretty": "p", "bytes": "b",
             "signal": "-6", "inputs": [{"location": "r0", "value": "1"}]},
        ])))
        .unwrap();
        let bytes = serde_json::to_vec(&decoded).unwrap();
        assert_eq!(parse_batch(&bytes).unwrap(), decoded);
    }
}
