// src/ip.rs

use std::{fmt, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum IpType {
    Data,
    OpenBracket,
    CloseBracket,
}

/// Correlation tag carried by a packet. A packet without one is global.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(tag: impl Into<String>) -> Self {
        Scope(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Scope {
    fn from(tag: &str) -> Self {
        Scope(tag.to_string())
    }
}

impl From<String> for Scope {
    fn from(tag: String) -> Self {
        Scope(tag)
    }
}

impl From<u64> for Scope {
    fn from(tag: u64) -> Self {
        Scope(tag.to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of data moving through a network.
///
/// The payload sits behind an `Arc`: plain clones share it, so fan-out of a
/// non-clonable packet hands every receiver the same value. Use
/// [`InformationPacket::deep_clone`] to get an independent copy.
#[derive(Debug, Clone, PartialEq)]
pub struct InformationPacket {
    kind: IpType,
    data: Arc<Value>,
    scope: Option<Scope>,
    index: Option<usize>,
    datatype: Option<String>,
    schema: Option<String>,
    clonable: bool,
    initial: bool,
}

pub type Ip = InformationPacket;

impl InformationPacket {
    pub fn new(kind: IpType, data: impl Into<Value>) -> Self {
        Self {
            kind,
            data: Arc::new(data.into()),
            scope: None,
            index: None,
            datatype: None,
            schema: None,
            clonable: false,
            initial: false,
        }
    }

    pub fn data(data: impl Into<Value>) -> Self {
        Self::new(IpType::Data, data)
    }

    pub fn open_bracket(data: impl Into<Value>) -> Self {
        Self::new(IpType::OpenBracket, data)
    }

    pub fn close_bracket(data: impl Into<Value>) -> Self {
        Self::new(IpType::CloseBracket, data)
    }

    pub fn with_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Clonable packets are deep-copied for every extra receiver on fan-out.
    pub fn clonable(mut self, clonable: bool) -> Self {
        self.clonable = clonable;
        self
    }

    pub fn initial(mut self, initial: bool) -> Self {
        self.initial = initial;
        self
    }

    pub fn kind(&self) -> IpType {
        self.kind
    }

    pub fn is_data(&self) -> bool {
        self.kind == IpType::Data
    }

    pub fn is_open(&self) -> bool {
        self.kind == IpType::OpenBracket
    }

    pub fn is_close(&self) -> bool {
        self.kind == IpType::CloseBracket
    }

    pub fn is_bracket(&self) -> bool {
        self.kind != IpType::Data
    }

    pub fn value(&self) -> &Value {
        &self.data
    }

    pub fn payload(&self) -> Arc<Value> {
        Arc::clone(&self.data)
    }

    /// Take the payload out, copying only when it is still shared.
    pub fn into_value(self) -> Value {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn datatype(&self) -> Option<&str> {
        self.datatype.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn is_clonable(&self) -> bool {
        self.clonable
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }

    pub(crate) fn set_scope(&mut self, scope: Option<Scope>) {
        self.scope = scope;
    }

    pub(crate) fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub(crate) fn set_datatype(&mut self, datatype: Option<String>) {
        self.datatype = datatype;
    }

    pub(crate) fn set_schema(&mut self, schema: Option<String>) {
        self.schema = schema;
    }

    /// Same metadata, independent payload.
    pub fn deep_clone(&self) -> Self {
        Self {
            data: Arc::new((*self.data).clone()),
            ..self.clone()
        }
    }

    /// True when both packets point at the very same payload.
    pub fn same_payload(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl From<Value> for InformationPacket {
    fn from(value: Value) -> Self {
        InformationPacket::data(value)
    }
}

fn show(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl fmt::Display for InformationPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            IpType::Data => write!(f, "DATA {}", show(&self.data)),
            IpType::OpenBracket => write!(f, "< {}", show(&self.data)),
            IpType::CloseBracket => f.write_str(">"),
        }
    }
}
