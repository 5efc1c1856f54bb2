use std::str::FromStr;

use crate::{Error, Result};

/// A `key=value` match field or a bare flag such as `ip`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowField {
    pub name: String,
    pub value: Option<String>,
}

/// A `name:value` action or a bare action such as `drop`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowAction {
    pub name: String,
    pub value: Option<String>,
}

/// One line of `ovs-ofctl dump-flows` output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedFlow {
    fields: Vec<FlowField>,
    actions: Vec<FlowAction>,
}

impl ParsedFlow {
    pub fn parse(flow: &str) -> Result<Self> {
        let (matches, actions) = flow
            .split_once("actions=")
            .ok_or_else(|| Error::InvalidFlow(flow.to_string()))?;

        let fields = matches
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(|token| match token.split_once('=') {
                Some((name, value)) => FlowField {
                    name: name.to_string(),
                    value: Some(value.to_string()),
                },
                None => FlowField {
                    name: token.to_string(),
                    value: None,
                },
            })
            .collect();

        let actions = split_actions(actions.trim())
            .into_iter()
            .map(|action| match action.split_once(':') {
                Some((name, value)) => FlowAction {
                    name: name.to_string(),
                    value: Some(value.to_string()),
                },
                None => FlowAction {
                    name: action.to_string(),
                    value: None,
                },
            })
            .collect();

        Ok(Self { fields, actions })
    }

    pub fn find_field(&self, name: &str) -> Option<&FlowField> {
        self.fields.iter().find(|field| field.name == name)
    }

    fn field_value<T: FromStr>(&self, name: &str) -> Option<T> {
        self.find_field(name)?.value.as_deref()?.parse().ok()
    }

    pub fn table(&self) -> Option<u8> {
        self.field_value("table")
    }

    pub fn n_packets(&self) -> Option<u64> {
        self.field_value("n_packets")
    }

    pub fn actions(&self) -> &[FlowAction] {
        &self.actions
    }

    pub fn find_action(&self, name: &str) -> Option<&FlowAction> {
        self.actions.iter().find(|action| action.name == name)
    }
}

impl FromStr for ParsedFlow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Splits an action list on the commas that are not nested inside brackets
/// or parentheses, e.g. `ct(commit,table=20),output:2`.
fn split_actions(actions: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in actions.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&actions[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&actions[start..]);
    parts.retain(|part| !part.is_empty());
    parts
}
