//! What an effect resolves to.

use indexmap::IndexMap;
use serde_json::Value;

use crate::action::Action;
use crate::effect::EffectKind;
use crate::error::MissileError;
use crate::task::Task;

/// The value an interpreted effect resumes its saga with.
///
/// | Effect                          | Outcome                      |
/// |---------------------------------|------------------------------|
/// | CALL                            | `Value`                      |
/// | PUT                             | `Action` (the dispatched one)|
/// | TAKE (pattern)                  | `Action`                     |
/// | TAKE (channel)                  | `Message` or `Closed`        |
/// | DELAY, CANCEL                   | `Unit`                       |
/// | FORK, SPAWN, watchers           | `Task`                       |
/// | RACE                            | `Map` with the winner only   |
/// | ALL (list / keyed)              | `List` / `Map`               |
#[derive(Debug, Clone)]
pub enum Outcome {
    Unit,
    Value(Value),
    Action(Action),
    Task(Task),
    Message(Value),
    Closed,
    List(Vec<Outcome>),
    Map(IndexMap<String, Outcome>),
}

impl Outcome {
    /// Short name of the variant, used in mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            Outcome::Unit => "unit",
            Outcome::Value(_) => "value",
            Outcome::Action(_) => "action",
            Outcome::Task(_) => "task",
            Outcome::Message(_) => "message",
            Outcome::Closed => "closed",
            Outcome::List(_) => "list",
            Outcome::Map(_) => "map",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Outcome::Closed)
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Outcome::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_action(self) -> Option<Action> {
        match self {
            Outcome::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            Outcome::Task(task) => Some(task),
            _ => None,
        }
    }

    /// The channel message, or `None` for `Closed` (and any other shape).
    pub fn into_message(self) -> Option<Value> {
        match self {
            Outcome::Message(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Outcome>> {
        match self {
            Outcome::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<IndexMap<String, Outcome>> {
        match self {
            Outcome::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Lossy JSON view: tasks become their ids, `Unit` and `Closed` become null.
    pub fn to_json(&self) -> Value {
        match self {
            Outcome::Unit | Outcome::Closed => Value::Null,
            Outcome::Value(value) | Outcome::Message(value) => value.clone(),
            Outcome::Action(action) => serde_json::to_value(action).unwrap_or(Value::Null),
            Outcome::Task(task) => Value::from(task.id().as_u64()),
            Outcome::List(list) => Value::Array(list.iter().map(Outcome::to_json).collect()),
            Outcome::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, outcome)| (key.clone(), outcome.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Build the error for an outcome that does not have the requested shape.
pub(crate) fn mismatch(effect: EffectKind, expected: &'static str, found: &Outcome) -> anyhow::Error {
    MissileError::UnexpectedOutcome {
        effect,
        expected,
        found: found.shape(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors_match_shape() {
        assert_eq!(Outcome::Value(json!(1)).into_value(), Some(json!(1)));
        assert_eq!(Outcome::Unit.into_value(), None);
        assert_eq!(
            Outcome::Action(Action::new("a")).into_action(),
            Some(Action::new("a"))
        );
        assert!(Outcome::Closed.is_closed());
        assert_eq!(Outcome::Closed.into_message(), None);
    }

    #[test]
    fn test_to_json_nested() {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), Outcome::Value(json!(1)));
        map.insert(
            "b".to_string(),
            Outcome::List(vec![Outcome::Unit, Outcome::Message(json!("m"))]),
        );

        assert_eq!(Outcome::Map(map).to_json(), json!({ "a": 1, "b": [null, "m"] }));
    }

    #[test]
    fn test_mismatch_error() {
        let err = mismatch(EffectKind::Call, "value", &Outcome::Closed);
        assert_eq!(err.to_string(), "CALL resolved to closed, expected value");
    }
}
