//! Native (in-process) tools and the catalog the gateway merges with the registry

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::types::{ActiveTool, TransportKind, empty_object_schema};

pub mod builtin;

/// Structural description of a native tool's arguments
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSchema {
    /// An object with named fields
    Object(Vec<SchemaField>),
    /// A shape with no generic input-schema equivalent
    Opaque,
}

/// One named argument of a native tool
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub kind: FieldKind,
    pub description: Option<String>,
    pub required: bool,
}

/// Argument value types native tools can declare
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Enum(Vec<String>),
    Array(Box<FieldKind>),
    /// Anything else; rendered without a type constraint
    Unsupported,
}

impl SchemaField {
    pub fn required(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: Some(description.to_string()),
            required: true,
        }
    }

    pub fn optional(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

impl FieldKind {
    fn to_json(&self) -> Value {
        match self {
            FieldKind::String => serde_json::json!({ "type": "string" }),
            FieldKind::Number => serde_json::json!({ "type": "number" }),
            FieldKind::Integer => serde_json::json!({ "type": "integer" }),
            FieldKind::Boolean => serde_json::json!({ "type": "boolean" }),
            FieldKind::Enum(values) => serde_json::json!({ "type": "string", "enum": values }),
            FieldKind::Array(items) => serde_json::json!({ "type": "array", "items": items.to_json() }),
            FieldKind::Unsupported => serde_json::json!({}),
        }
    }
}

impl ToolSchema {
    /// Render as a generic JSON-schema input document.
    /// `Opaque` degrades to an object with no properties.
    pub fn to_input_schema(&self) -> Value {
        match self {
            ToolSchema::Opaque => empty_object_schema(),
            ToolSchema::Object(fields) => {
                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    let mut prop = field.kind.to_json();
                    if let (Some(desc), Some(obj)) = (&field.description, prop.as_object_mut()) {
                        obj.insert("description".to_string(), Value::String(desc.clone()));
                    }
                    properties.insert(field.name.clone(), prop);
                    if field.required {
                        required.push(Value::String(field.name.clone()));
                    }
                }
                serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                })
            }
        }
    }
}

/// A tool implemented inside the gateway process
#[async_trait]
pub trait NativeTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Argument contract, stated directly by the tool
    fn describe(&self) -> ToolSchema;
    async fn execute(&self, input: Value) -> Result<String>;
}

/// Static catalog of native tools, grouped under the server names that own them
pub struct NativeCatalog {
    tools: HashMap<Arc<str>, (Arc<str>, Arc<dyn NativeTool>)>,
}

impl NativeCatalog {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a native tool owned by `server_name`
    pub fn register(&mut self, server_name: &str, tool: Arc<dyn NativeTool>) {
        let name: Arc<str> = Arc::from(tool.name());
        debug!("Registering native tool: {} (server: {})", name, server_name);
        self.tools.insert(name, (Arc::from(server_name), tool));
    }

    /// Look up a tool and its owning server name
    pub fn get(&self, name: &str) -> Option<(&str, Arc<dyn NativeTool>)> {
        self.tools
            .get(name)
            .map(|(server, tool)| (server.as_ref(), tool.clone()))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All native tools, tagged like registry tools, sorted by name
    pub fn list(&self) -> Vec<ActiveTool> {
        let mut tools: Vec<ActiveTool> = self
            .tools
            .values()
            .map(|(server, tool)| ActiveTool {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.describe().to_input_schema(),
                server_name: server.to_string(),
                transport_kind: TransportKind::Native,
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

impl Default for NativeCatalog {
    fn default() -> Self {
        Self::new()
    }
}
