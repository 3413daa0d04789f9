//! Value translation: VWP runtime values to the protocol-facing `Variable`
//! model.
//!
//! Dispatch is on the *runtime* tag of the value, not its declared type —
//! Vela's unions and `any` mean the declared type can be broader than what is
//! actually there. Structured values get one shallow `Object.Summary` read
//! for their display string; children stay lazy behind a
//! `variablesReference`.
//!
//! Translation never fails a request: a value the VM cannot read any more
//! (collected, detached, or an unrecognized tag from a newer VM) degrades to
//! an `unknown` variable with a sentinel display. Each such fallback is
//! logged under the `vela.dap.translate` target so introspection bugs stay
//! diagnosable.

use parking_lot::Mutex;
use serde_json::{json, Value};
use vela_vdwp::{
    canonical_float, NamedValue, ObjectId, ObjectSummary, RefTag, ThreadId, TypeDesc, VwpClient,
    VwpValue,
};

use crate::{
    bridge::SymbolBridge,
    refs::{RefTarget, VarStore},
};

/// Display sentinel for values the runtime can no longer read.
pub const UNREADABLE: &str = "<unreadable>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Primitive,
    Structured,
    Reference,
    Error,
    Unknown,
}

impl VariableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VariableKind::Primitive => "primitive",
            VariableKind::Structured => "structured",
            VariableKind::Reference => "reference",
            VariableKind::Error => "error",
            VariableKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub declared_type: Option<String>,
    pub kind: VariableKind,
    pub value: String,
    /// Non-zero iff the variable has lazily fetchable children.
    pub variables_reference: i64,
}

impl Variable {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "value": self.value,
            "type": self.declared_type,
            "kind": self.kind.as_str(),
            "variablesReference": self.variables_reference,
        })
    }
}

/// One translation context: a thread at a particular suspension generation.
pub struct Translator<'a> {
    pub client: &'a VwpClient,
    pub bridge: &'a SymbolBridge,
    pub store: &'a Mutex<VarStore>,
    pub thread: ThreadId,
    pub generation: u64,
}

impl Translator<'_> {
    pub async fn translate_named(&self, named: &NamedValue) -> Variable {
        self.translate(&named.name, named.declared_type.clone(), &named.value)
            .await
    }

    pub async fn translate(
        &self,
        name: &str,
        declared_type: Option<String>,
        value: &VwpValue,
    ) -> Variable {
        match value {
            VwpValue::Nil => Variable {
                name: name.to_string(),
                declared_type,
                kind: VariableKind::Unknown,
                value: "()".to_string(),
                variables_reference: 0,
            },
            VwpValue::Bool(_)
            | VwpValue::Int(_)
            | VwpValue::Float(_)
            | VwpValue::Byte(_)
            | VwpValue::Str(_) => Variable {
                name: name.to_string(),
                declared_type,
                kind: VariableKind::Primitive,
                value: display_primitive(value),
                variables_reference: 0,
            },
            VwpValue::Ref { id, tag, type_desc } => {
                self.translate_ref(name, declared_type, *id, *tag, *type_desc)
                    .await
            }
        }
    }

    async fn translate_ref(
        &self,
        name: &str,
        declared_type: Option<String>,
        object: ObjectId,
        tag: RefTag,
        type_desc: TypeDesc,
    ) -> Variable {
        if let RefTag::Unrecognized(raw) = tag {
            tracing::debug!(
                target: "vela.dap.translate",
                object,
                tag = raw,
                "unrecognized runtime tag, rendering as unknown"
            );
            return unreadable(name, declared_type);
        }

        let summary = match self.client.object_summary(object).await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::debug!(
                    target: "vela.dap.translate",
                    object,
                    ?tag,
                    %err,
                    "object summary unavailable, rendering as unknown"
                );
                return unreadable(name, declared_type);
            }
        };

        let (kind, display) = match tag {
            RefTag::Record => (
                VariableKind::Structured,
                format!(
                    "{} ({})",
                    summary.type_name,
                    count_label(summary.size, "field")
                ),
            ),
            RefTag::Map => (
                VariableKind::Structured,
                format!("map ({})", count_label(summary.size, "entry")),
            ),
            RefTag::List => (
                VariableKind::Structured,
                format!("list ({})", count_label(summary.size, "item")),
            ),
            RefTag::Tuple => (
                VariableKind::Structured,
                format!("tuple ({})", count_label(summary.size, "item")),
            ),
            RefTag::Error => (VariableKind::Error, error_display(&summary)),
            RefTag::Opaque => (
                VariableKind::Reference,
                format!("<{}>", summary.type_name),
            ),
            RefTag::Unrecognized(_) => unreachable!("handled above"),
        };

        let declared_type = declared_type.or_else(|| Some(summary.type_name.clone()));
        let variables_reference = self.store.lock().intern(
            self.thread,
            self.generation,
            RefTarget::Object {
                object,
                tag,
                type_desc,
            },
        );

        Variable {
            name: name.to_string(),
            declared_type,
            kind,
            value: display,
            variables_reference,
        }
    }

    /// Children of an object reference, per its tag.
    ///
    /// A child that cannot be translated degrades individually; a children
    /// fetch that fails outright degrades to no children, logged.
    pub async fn object_children(
        &self,
        object: ObjectId,
        tag: RefTag,
        type_desc: TypeDesc,
    ) -> Vec<Variable> {
        let children = match self.client.object_children(object, 0, 0).await {
            Ok(children) => children,
            Err(err) => {
                tracing::debug!(
                    target: "vela.dap.translate",
                    object,
                    ?tag,
                    %err,
                    "object children unavailable"
                );
                return Vec::new();
            }
        };

        match tag {
            RefTag::Record => self.record_children(type_desc, children).await,
            RefTag::Error => self.error_children(children).await,
            _ => {
                let mut out = Vec::with_capacity(children.len());
                for child in &children {
                    out.push(self.translate_named(child).await);
                }
                out
            }
        }
    }

    /// Record children keep declaration order; declared types come from the
    /// VM when present, from the type bridge otherwise.
    async fn record_children(&self, type_desc: TypeDesc, children: Vec<NamedValue>) -> Vec<Variable> {
        let declared = self.bridge.declared_field_types(type_desc).await;
        let mut out = Vec::with_capacity(children.len());
        for child in &children {
            let declared_type = child.declared_type.clone().or_else(|| {
                declared.as_ref().and_then(|fields| {
                    fields
                        .iter()
                        .find(|(name, _)| *name == child.name)
                        .map(|(_, field_type)| field_type.clone())
                })
            });
            out.push(
                self.translate(&child.name, declared_type, &child.value)
                    .await,
            );
        }
        out
    }

    /// Error children always include `message`; `cause` only when there is
    /// one.
    async fn error_children(&self, children: Vec<NamedValue>) -> Vec<Variable> {
        let mut out = Vec::with_capacity(children.len() + 1);
        let mut has_message = false;
        for child in &children {
            if child.name == "cause" && child.value == VwpValue::Nil {
                continue;
            }
            if child.name == "message" {
                has_message = true;
            }
            out.push(self.translate_named(child).await);
        }
        if !has_message {
            // The runtime omits the slot entirely for message-less errors.
            out.insert(
                0,
                self.translate("message", Some("Str".to_string()), &VwpValue::Str(String::new()))
                    .await,
            );
        }
        out
    }
}

fn unreadable(name: &str, declared_type: Option<String>) -> Variable {
    Variable {
        name: name.to_string(),
        declared_type,
        kind: VariableKind::Unknown,
        value: UNREADABLE.to_string(),
        variables_reference: 0,
    }
}

fn error_display(summary: &ObjectSummary) -> String {
    match &summary.brief {
        Some(brief) if !brief.is_empty() => format!("{}: {}", summary.type_name, brief),
        _ => summary.type_name.clone(),
    }
}

fn count_label(count: u32, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else if noun == "entry" {
        format!("{count} entries")
    } else {
        format!("{count} {noun}s")
    }
}

/// Canonical display for primitives; floats delegate to the runtime's own
/// formatting so displays are identical to what the program would print.
pub fn display_primitive(value: &VwpValue) -> String {
    match value {
        VwpValue::Bool(v) => v.to_string(),
        VwpValue::Int(v) => v.to_string(),
        VwpValue::Float(v) => canonical_float(*v),
        VwpValue::Byte(v) => v.to_string(),
        VwpValue::Str(v) => v.clone(),
        VwpValue::Nil | VwpValue::Ref { .. } => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_displays_match_runtime_formatting() {
        assert_eq!(display_primitive(&VwpValue::Int(42)), "42");
        assert_eq!(display_primitive(&VwpValue::Bool(false)), "false");
        assert_eq!(display_primitive(&VwpValue::Float(2.0)), "2.0");
        assert_eq!(display_primitive(&VwpValue::Float(0.5)), "0.5");
        assert_eq!(display_primitive(&VwpValue::Byte(7)), "7");
        assert_eq!(display_primitive(&VwpValue::Str("s".to_string())), "s");
    }

    #[test]
    fn count_labels_pluralize() {
        assert_eq!(count_label(1, "field"), "1 field");
        assert_eq!(count_label(2, "field"), "2 fields");
        assert_eq!(count_label(3, "entry"), "3 entries");
    }
}
