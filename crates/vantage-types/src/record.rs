//! The event record every tracker emits.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::element::ElementRef;

/// Flat variable map carried by an [`EventRecord`].
pub type Vars = BTreeMap<String, Value>;

/// A single tracked occurrence.
///
/// Records are immutable once built. They are cloned into buffers and handed
/// to listeners by value; nothing downstream can change what a tracker
/// observed.
#[derive(Debug, Clone)]
pub struct EventRecord {
    target: ElementRef,
    event_type: String,
    vars: Vars,
}

impl EventRecord {
    /// Builds a record whose variables start from the target's declared
    /// variables, with `vars` taking precedence on key collisions.
    pub fn new(target: ElementRef, event_type: impl Into<String>, vars: Vars) -> Self {
        let mut merged = target.declared_vars();
        merged.extend(vars);
        Self::without_declared_vars(target, event_type, merged)
    }

    /// Builds a record carrying exactly `vars`.
    pub fn without_declared_vars(
        target: ElementRef,
        event_type: impl Into<String>,
        vars: Vars,
    ) -> Self {
        Self {
            target,
            event_type: event_type.into(),
            vars,
        }
    }

    /// The most relevant element for this occurrence.
    pub fn target(&self) -> &ElementRef {
        &self.target
    }

    /// The event type string (for example `click` or `video-play`).
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// All variables of the record.
    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    /// A single variable, if present.
    pub fn var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// JSON view of the record, identifying the target by id and tag name.
    pub fn to_json(&self) -> Value {
        json!({
            "type": self.event_type,
            "target": {
                "id": self.target.id(),
                "tag": self.target.tag_name(),
            },
            "vars": self.vars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Element, SignalSource};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Leaf {
        vars: Vars,
    }

    impl Element for Leaf {
        fn id(&self) -> u64 {
            7
        }
        fn tag_name(&self) -> &str {
            "div"
        }
        fn parent(&self) -> Option<ElementRef> {
            None
        }
        fn declared_vars(&self) -> Vars {
            self.vars.clone()
        }
        fn signals(&self) -> Option<Arc<dyn SignalSource>> {
            None
        }
    }

    fn leaf() -> ElementRef {
        let mut vars = Vars::new();
        vars.insert("campaign".to_string(), json!("spring"));
        vars.insert("slot".to_string(), json!("declared"));
        Arc::new(Leaf { vars })
    }

    #[test]
    fn event_vars_override_declared_vars() {
        let mut vars = Vars::new();
        vars.insert("slot".to_string(), json!("event"));

        let record = EventRecord::new(leaf(), "click", vars);

        assert_eq!(record.var("campaign"), Some(&json!("spring")));
        assert_eq!(record.var("slot"), Some(&json!("event")));
    }

    #[test]
    fn suppressed_merge_keeps_only_event_vars() {
        let record = EventRecord::without_declared_vars(leaf(), "scroll", Vars::new());
        assert!(record.vars().is_empty());
        assert_eq!(record.event_type(), "scroll");
    }

    #[test]
    fn json_view_identifies_target() {
        let record = EventRecord::without_declared_vars(leaf(), "timer", Vars::new());
        let value = record.to_json();
        assert_eq!(value["target"]["id"], 7);
        assert_eq!(value["target"]["tag"], "div");
        assert_eq!(value["type"], "timer");
    }
}
