use crate::grading::EnteredScore;
use crate::ipc::error::HandlerErr;
use crate::store::ResultScope;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

pub fn parse_period(params: &Value) -> Result<(String, String), HandlerErr> {
    Ok((
        required_str(params, "session")?.to_string(),
        required_str(params, "term")?.to_string(),
    ))
}

pub fn parse_scope(params: &Value) -> Result<ResultScope, HandlerErr> {
    let (session, term) = parse_period(params)?;
    Ok(ResultScope {
        class_id: required_str(params, "classId")?.to_string(),
        subject_code: required_str(params, "subjectCode")?.to_ascii_uppercase(),
        session,
        term,
    })
}

/// `{ "ca": 7, "test": "12", "exam": "" }` -> typed entries. Keys are
/// normalised to lowercase to match configured component keys.
pub fn parse_entered_scores(v: Option<&Value>, field: &str) -> Result<BTreeMap<String, EnteredScore>, HandlerErr> {
    let Some(v) = v else {
        return Ok(BTreeMap::new());
    };
    if v.is_null() {
        return Ok(BTreeMap::new());
    }
    let Some(obj) = v.as_object() else {
        return Err(HandlerErr::bad_params(format!("{} must be an object", field)));
    };
    let mut out = BTreeMap::new();
    for (k, raw) in obj {
        let key = k.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(HandlerErr::bad_params(format!("{} has a blank component key", field))
                .with_details(json!({ "field": field })));
        }
        out.insert(key, EnteredScore::from_json(raw));
    }
    Ok(out)
}
