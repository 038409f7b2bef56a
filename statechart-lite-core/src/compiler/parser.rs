//! Loader — parses the textual chart description (object form) into the
//! description model.
//!
//! Accepts JSON and YAML. All dialect shorthands are normalized here:
//! bare-string transitions, single-or-array targets, `cond`/`guard`
//! aliases, integer-ms `after` keys, string-or-object `onDone`/`onError`,
//! string-or-object action references. Relative `.child` targets are
//! rewritten to absolute `#machine.path.child` form against the
//! transition's source; absolute and bare references pass through.

use super::desc::*;
use crate::error::{LoadError, LoadErrorKind};
use crate::types::StateKind;
use serde_json::{Map, Value};

/// Parse a JSON chart description.
pub fn parse_chart(text: &str) -> Result<StateDesc, LoadError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LoadError::new(LoadErrorKind::Syntax, "#", e.to_string()))?;
    parse_value(&value)
}

/// Parse a YAML chart description (alternate authoring format).
pub fn parse_chart_yaml(text: &str) -> Result<StateDesc, LoadError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| LoadError::new(LoadErrorKind::Syntax, "#", e.to_string()))?;
    let value = yaml_to_json(&yaml)
        .map_err(|detail| LoadError::new(LoadErrorKind::BadShape, "#", detail))?;
    parse_value(&value)
}

/// Parse an already-decoded object form.
pub fn parse_value(value: &Value) -> Result<StateDesc, LoadError> {
    let obj = value
        .as_object()
        .ok_or_else(|| LoadError::new(LoadErrorKind::BadShape, "#", "chart must be an object"))?;
    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| LoadError::new(LoadErrorKind::MissingKey, "#", "`id` is required"))?;
    if id.is_empty() {
        return Err(LoadError::new(
            LoadErrorKind::BadShape,
            "#",
            "`id` must be non-empty",
        ));
    }
    let path = format!("#{id}");
    parse_node(id, obj, &path)
}

fn parse_node(name: &str, obj: &Map<String, Value>, path: &str) -> Result<StateDesc, LoadError> {
    let mut desc = StateDesc::leaf(name);

    // `states` first: the derived kind depends on children being present.
    if let Some(states) = obj.get("states") {
        let states = states.as_object().ok_or_else(|| {
            LoadError::new(LoadErrorKind::BadShape, path, "`states` must be an object")
        })?;
        for (child_name, child_value) in states {
            let child_obj = child_value.as_object().ok_or_else(|| {
                LoadError::new(
                    LoadErrorKind::BadShape,
                    format!("{path}.{child_name}"),
                    "state must be an object",
                )
            })?;
            let child_path = format!("{path}.{child_name}");
            desc.children
                .push(parse_node(child_name, child_obj, &child_path)?);
        }
    }

    desc.kind = match obj.get("type").and_then(Value::as_str) {
        Some("atomic") => StateKind::Atomic,
        Some("compound") => StateKind::Compound,
        Some("parallel") => StateKind::Parallel,
        Some("final") => StateKind::Final,
        Some(other) => {
            return Err(LoadError::new(
                LoadErrorKind::BadShape,
                path,
                format!("unknown state type `{other}`"),
            ))
        }
        None if desc.children.is_empty() => StateKind::Atomic,
        None => StateKind::Compound,
    };

    desc.initial = obj
        .get("initial")
        .map(|v| {
            v.as_str().map(str::to_owned).ok_or_else(|| {
                LoadError::new(LoadErrorKind::BadShape, path, "`initial` must be a string")
            })
        })
        .transpose()?;

    match desc.kind {
        StateKind::Compound if !desc.children.is_empty() && desc.initial.is_none() => {
            return Err(LoadError::new(
                LoadErrorKind::MissingKey,
                path,
                "compound state requires `initial`",
            ));
        }
        StateKind::Parallel if desc.initial.is_some() => {
            return Err(LoadError::new(
                LoadErrorKind::ForbiddenKey,
                path,
                "parallel state may not declare `initial`",
            ));
        }
        _ => {}
    }

    if let Some(context) = obj.get("context") {
        let context = context.as_object().ok_or_else(|| {
            LoadError::new(LoadErrorKind::BadShape, path, "`context` must be an object")
        })?;
        desc.context = context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }

    if let Some(entry) = obj.get("entry") {
        desc.entry = parse_actions(entry, path)?;
    }
    if let Some(exit) = obj.get("exit") {
        desc.exit = parse_actions(exit, path)?;
    }

    if let Some(on) = obj.get("on") {
        let on = on.as_object().ok_or_else(|| {
            LoadError::new(LoadErrorKind::BadShape, path, "`on` must be an object")
        })?;
        for (event, spec) in on {
            if event.is_empty() {
                return Err(LoadError::new(
                    LoadErrorKind::BadShape,
                    path,
                    "empty event name in `on`",
                ));
            }
            desc.on.push(OnDesc {
                event: event.clone(),
                transitions: parse_transitions(spec, path)?,
            });
        }
    }

    if let Some(after) = obj.get("after") {
        let after = after.as_object().ok_or_else(|| {
            LoadError::new(LoadErrorKind::BadShape, path, "`after` must be an object")
        })?;
        for (key, spec) in after {
            let delay_ms: u64 = key.parse().map_err(|_| {
                LoadError::new(
                    LoadErrorKind::BadShape,
                    path,
                    format!("`after` key `{key}` is not integer milliseconds"),
                )
            })?;
            desc.after.push(AfterDesc {
                delay_ms,
                transitions: parse_transitions(spec, path)?,
            });
        }
    }

    if let Some(always) = obj.get("always") {
        desc.always = parse_transitions(always, path)?;
    }

    if let Some(invoke) = obj.get("invoke") {
        desc.invoke = Some(parse_invoke(invoke, path)?);
    }

    desc.meta = obj.get("meta").cloned();
    desc.tags = obj.get("tags").cloned();
    desc.description = obj
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_owned);
    desc.output = obj.get("output").cloned();

    Ok(desc)
}

fn parse_invoke(value: &Value, path: &str) -> Result<InvokeDesc, LoadError> {
    let obj = value.as_object().ok_or_else(|| {
        LoadError::new(LoadErrorKind::BadShape, path, "`invoke` must be an object")
    })?;
    let src = obj
        .get("src")
        .and_then(Value::as_str)
        .ok_or_else(|| LoadError::new(LoadErrorKind::MissingKey, path, "`invoke.src` required"))?;
    let on_done = match obj.get("onDone") {
        Some(spec) => parse_transitions(spec, path)?,
        None => Vec::new(),
    };
    let on_error = match obj.get("onError") {
        Some(spec) => parse_transitions(spec, path)?,
        None => Vec::new(),
    };
    Ok(InvokeDesc {
        src: src.to_owned(),
        on_done,
        on_error,
        data: obj.get("data").cloned(),
    })
}

/// A transition spec is a bare target string, a transition object, or a
/// prioritized array of either.
fn parse_transitions(value: &Value, source_path: &str) -> Result<Vec<TransitionDesc>, LoadError> {
    match value {
        Value::String(target) => Ok(vec![TransitionDesc::to_target(normalize_target(
            target,
            source_path,
        )?)]),
        Value::Object(_) => Ok(vec![parse_transition(value, source_path)?]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(target) => Ok(TransitionDesc::to_target(normalize_target(
                    target,
                    source_path,
                )?)),
                Value::Object(_) => parse_transition(item, source_path),
                _ => Err(LoadError::new(
                    LoadErrorKind::BadShape,
                    source_path,
                    "transition list entries must be strings or objects",
                )),
            })
            .collect(),
        _ => Err(LoadError::new(
            LoadErrorKind::BadShape,
            source_path,
            "transition must be a string, object, or array",
        )),
    }
}

fn parse_transition(value: &Value, source_path: &str) -> Result<TransitionDesc, LoadError> {
    let obj = value.as_object().expect("checked by caller");

    let targets = match obj.get("target") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(target)) => vec![normalize_target(target, source_path)?],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| {
                        LoadError::new(
                            LoadErrorKind::BadShape,
                            source_path,
                            "multi-target entries must be strings",
                        )
                    })
                    .and_then(|s| normalize_target(s, source_path))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => {
            return Err(LoadError::new(
                LoadErrorKind::BadShape,
                source_path,
                "`target` must be a string or array of strings",
            ))
        }
    };

    // `cond` and `guard` are aliases; `guard` wins if both appear.
    let guard = obj
        .get("guard")
        .or_else(|| obj.get("cond"))
        .map(|v| {
            v.as_str().map(str::to_owned).ok_or_else(|| {
                LoadError::new(
                    LoadErrorKind::BadShape,
                    source_path,
                    "guard must be a string name",
                )
            })
        })
        .transpose()?;

    let actions = match obj.get("actions") {
        Some(spec) => parse_actions(spec, source_path)?,
        None => Vec::new(),
    };

    let internal = obj
        .get("internal")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(TransitionDesc {
        targets,
        guard,
        actions,
        internal,
    })
}

/// Action spec: a name string, a structured object, or an array of either.
fn parse_actions(value: &Value, path: &str) -> Result<Vec<ActionDesc>, LoadError> {
    match value {
        Value::String(_) | Value::Object(_) => Ok(vec![parse_action(value, path)?]),
        Value::Array(items) => items.iter().map(|item| parse_action(item, path)).collect(),
        _ => Err(LoadError::new(
            LoadErrorKind::BadShape,
            path,
            "actions must be a string, object, or array",
        )),
    }
}

fn parse_action(value: &Value, path: &str) -> Result<ActionDesc, LoadError> {
    match value {
        Value::String(name) => {
            if name.is_empty() {
                return Err(LoadError::new(
                    LoadErrorKind::BadShape,
                    path,
                    "action name must be non-empty",
                ));
            }
            Ok(ActionDesc::Named(name.clone()))
        }
        Value::Object(obj) => {
            let kind = obj.get("type").and_then(Value::as_str).ok_or_else(|| {
                LoadError::new(
                    LoadErrorKind::BadShape,
                    path,
                    "structured action requires `type`",
                )
            })?;
            match kind {
                "assign" => {
                    let values = obj
                        .get("values")
                        .and_then(Value::as_object)
                        .ok_or_else(|| {
                            LoadError::new(
                                LoadErrorKind::BadShape,
                                path,
                                "`assign` requires a `values` object",
                            )
                        })?;
                    Ok(ActionDesc::Assign(
                        values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    ))
                }
                "send" => {
                    let event = require_str(obj, "event", path)?;
                    let to = require_str(obj, "to", path)?;
                    let delay_ms = match obj.get("delay") {
                        None | Some(Value::Null) => None,
                        Some(v) => Some(v.as_u64().ok_or_else(|| {
                            LoadError::new(
                                LoadErrorKind::BadShape,
                                path,
                                "`send.delay` must be integer milliseconds",
                            )
                        })?),
                    };
                    Ok(ActionDesc::Send {
                        event,
                        to,
                        delay_ms,
                        payload: obj.get("payload").cloned(),
                    })
                }
                "raise" => Ok(ActionDesc::Raise {
                    event: require_str(obj, "event", path)?,
                    payload: obj.get("payload").cloned(),
                }),
                "spawn" => Ok(ActionDesc::Spawn {
                    src: require_str(obj, "src", path)?,
                    child_id: obj.get("id").and_then(Value::as_str).map(str::to_owned),
                }),
                "stop" => Ok(ActionDesc::Stop {
                    target: require_str(obj, "id", path)?,
                }),
                other => Err(LoadError::new(
                    LoadErrorKind::UnknownActionType,
                    path,
                    format!("`{other}` is not a recognized action type"),
                )),
            }
        }
        _ => Err(LoadError::new(
            LoadErrorKind::BadShape,
            path,
            "action must be a string or object",
        )),
    }
}

fn require_str(obj: &Map<String, Value>, key: &str, path: &str) -> Result<String, LoadError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            LoadError::new(
                LoadErrorKind::MissingKey,
                path,
                format!("`{key}` is required and must be a string"),
            )
        })
}

/// Rewrite a relative `.child` reference against its source state; keep
/// absolute and bare references verbatim (bare names resolve lazily during
/// compilation).
fn normalize_target(raw: &str, source_path: &str) -> Result<String, LoadError> {
    if raw.is_empty() {
        return Err(LoadError::new(
            LoadErrorKind::BadShape,
            source_path,
            "empty target reference",
        ));
    }
    if let Some(rest) = raw.strip_prefix('.') {
        if rest.is_empty() {
            return Err(LoadError::new(
                LoadErrorKind::BadShape,
                source_path,
                "relative target `.` names no child",
            ));
        }
        return Ok(format!("{source_path}.{rest}"));
    }
    Ok(raw.to_owned())
}

/// Convert a YAML document to the JSON object form, stringifying scalar
/// keys (`after: { 500: … }` is idiomatic YAML).
fn yaml_to_json(value: &serde_yaml::Value) -> Result<Value, String> {
    match value {
        serde_yaml::Value::Null => Ok(Value::Null),
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_yaml::Value::Number(n) => serde_json::to_value(n).map_err(|e| e.to_string()),
        serde_yaml::Value::String(s) => Ok(Value::String(s.clone())),
        serde_yaml::Value::Sequence(items) => Ok(Value::Array(
            items.iter().map(yaml_to_json).collect::<Result<_, _>>()?,
        )),
        serde_yaml::Value::Mapping(mapping) => {
            let mut obj = Map::new();
            for (k, v) in mapping {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    _ => return Err("unsupported mapping key".into()),
                };
                obj.insert(key, yaml_to_json(v)?);
            }
            Ok(Value::Object(obj))
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}
