//! A minimal GraphQL selection-set AST and printer.
//!
//! The distilled spec treats the query builder as an external collaborator
//! ("an abstract API that constructs selection-set trees and emits them as
//! wire text"); this module is this crate's concrete stand-in for that API.
//! The planner (`crate::planner`) is written only against the constructors
//! below — `field`, `alias`, `inline_fragment`, and the `Value` literal
//! helpers — so swapping in a different query-builder crate would only touch
//! this module.

use std::fmt::Write as _;

/// A GraphQL argument or input value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
    Null,
    Enum(String),
    List(Vec<Value>),
}

impl Value {
    pub fn list(values: impl IntoIterator<Item = Value>) -> Value {
        Value::List(values.into_iter().collect())
    }

    fn write(&self, out: &mut String) {
        match self {
            Value::Int(n) => {
                let _ = write!(out, "{n}");
            }
            Value::Str(s) => {
                out.push('"');
                for c in s.chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        _ => out.push(c),
                    }
                }
                out.push('"');
            }
            Value::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Null => out.push_str("null"),
            Value::Enum(e) => out.push_str(e),
            Value::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write(out);
                }
                out.push(']');
            }
        }
    }
}

/// One node of a selection set: a field (possibly aliased, possibly with
/// arguments and a nested selection set) or an inline fragment.
#[derive(Debug, Clone)]
pub enum Selection {
    Field {
        name: String,
        alias: Option<String>,
        args: Vec<(String, Value)>,
        children: Vec<Selection>,
    },
    InlineFragment {
        on_type: String,
        children: Vec<Selection>,
    },
}

/// A leaf or branch field named `name`, with `args` and nested `children`
/// (empty for a scalar leaf).
pub fn field(
    name: impl Into<String>,
    args: Vec<(String, Value)>,
    children: Vec<Selection>,
) -> Selection {
    Selection::Field {
        name: name.into(),
        alias: None,
        args,
        children,
    }
}

/// Re-aliases a field selection. Panics if given an inline fragment, since
/// only fields can carry an alias in GraphQL.
pub fn alias(new_alias: impl Into<String>, selection: Selection) -> Selection {
    match selection {
        Selection::Field {
            name, args, children, ..
        } => Selection::Field {
            name,
            alias: Some(new_alias.into()),
            args,
            children,
        },
        Selection::InlineFragment { .. } => panic!("cannot alias an inline fragment"),
    }
}

pub fn inline_fragment(on_type: impl Into<String>, children: Vec<Selection>) -> Selection {
    Selection::InlineFragment {
        on_type: on_type.into(),
        children,
    }
}

/// A leaf scalar selection with no arguments or children.
pub fn leaf(name: impl Into<String>) -> Selection {
    field(name, Vec::new(), Vec::new())
}

fn write_selection(out: &mut String, selection: &Selection, indent: usize) {
    let pad = "  ".repeat(indent);
    match selection {
        Selection::Field {
            name,
            alias: alias_name,
            args,
            children,
        } => {
            let _ = write!(out, "{pad}");
            if let Some(a) = alias_name {
                let _ = write!(out, "{a}: ");
            }
            out.push_str(name);
            if !args.is_empty() {
                out.push('(');
                for (i, (arg_name, value)) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{arg_name}: ");
                    value.write(out);
                }
                out.push(')');
            }
            if !children.is_empty() {
                out.push_str(" {\n");
                for child in children {
                    write_selection(out, child, indent + 1);
                }
                let _ = writeln!(out, "{pad}}}");
            } else {
                out.push('\n');
            }
        }
        Selection::InlineFragment { on_type, children } => {
            let _ = writeln!(out, "{pad}... on {on_type} {{");
            for child in children {
                write_selection(out, child, indent + 1);
            }
            let _ = writeln!(out, "{pad}}}");
        }
    }
}

/// Prints a top-level query document named `name` wrapping `selections`.
pub fn print_query(name: &str, selections: &[Selection]) -> String {
    let mut out = format!("query {name} {{\n");
    for selection in selections {
        write_selection(&mut out, selection, 1);
    }
    out.push('}');
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_nested_fields_and_arguments() {
        let doc = print_query(
            "MirrorUpdate",
            &[alias(
                "owndata_0",
                field(
                    "nodes",
                    vec![(
                        "ids".to_string(),
                        Value::list([Value::Str("i1".to_string())]),
                    )],
                    vec![inline_fragment(
                        "Issue",
                        vec![leaf("__typename"), leaf("id"), leaf("title")],
                    )],
                ),
            )],
        );
        assert!(doc.starts_with("query MirrorUpdate {\n"));
        assert!(doc.contains("owndata_0: nodes(ids: [\"i1\"]) {"));
        assert!(doc.contains("... on Issue {"));
        assert!(doc.contains("title"));
    }

    #[test]
    fn escapes_string_values() {
        let mut out = String::new();
        Value::Str("a\"b\\c".to_string()).write(&mut out);
        assert_eq!(out, "\"a\\\"b\\\\c\"");
    }
}
