use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TensorDescriptor;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IOName(pub String);

impl IOName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IOName {
    fn from(s: &str) -> Self {
        IOName(s.to_string())
    }
}

impl From<String> for IOName {
    fn from(s: String) -> Self {
        IOName(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Input,
    Output,
}

impl EndpointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointKind::Input => "input",
            EndpointKind::Output => "output",
        }
    }
}

/// A named graph endpoint resolved to the tensor it carries.
#[derive(Clone, Debug, PartialEq)]
pub struct BindingPointInfo {
    pub name: IOName,
    pub kind: EndpointKind,
    pub desc: TensorDescriptor,
}
