//! 补全服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化测试替身）实现 CompletionService：
//! complete(history, system_prompt, message, schema?) 返回自由文本或按 OutputSchema 解析的结构化对象。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::memory::Message;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Request(String),

    /// 结构化输出不符合 schema（对外单独上报，不自动重试）
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Completion timed out after {0}s")]
    Timeout(u64),
}

/// 补全结果
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    Structured(Value),
}

impl Completion {
    /// 文本形式（结构化结果输出 JSON）
    pub fn text(&self) -> String {
        match self {
            Completion::Text(s) => s.clone(),
            Completion::Structured(v) => v.to_string(),
        }
    }

    /// 取结构化对象；文本结果尝试按 JSON 解析
    pub fn into_structured(self) -> Result<Value, CompletionError> {
        match self {
            Completion::Structured(v) => Ok(v),
            Completion::Text(s) => serde_json::from_str(s.trim()).map_err(|e| {
                CompletionError::SchemaValidation(format!("expected JSON object: {e}"))
            }),
        }
    }
}

/// 字段类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    String,
    Enum { values: Vec<String> },
    Object { fields: Vec<SchemaField> },
    List { item: Box<FieldType> },
    /// 直接给出 JSON Schema（如 schemars 生成的计划结构）
    Json { schema: Value },
}

impl FieldType {
    fn to_json_schema(&self) -> Value {
        match self {
            FieldType::Boolean => json!({"type": "boolean"}),
            FieldType::String => json!({"type": "string"}),
            FieldType::Enum { values } => json!({"type": "string", "enum": values}),
            FieldType::Object { fields } => object_schema(fields),
            FieldType::List { item } => json!({"type": "array", "items": item.to_json_schema()}),
            FieldType::Json { schema } => schema.clone(),
        }
    }

    /// 浅层类型检查
    fn check(&self, value: &Value) -> bool {
        match self {
            FieldType::Boolean => value.is_boolean(),
            FieldType::String => value.is_string(),
            FieldType::Enum { values } => value
                .as_str()
                .is_some_and(|s| values.iter().any(|v| v == s)),
            FieldType::Object { .. } => value.is_object(),
            FieldType::List { .. } => value.is_array(),
            FieldType::Json { .. } => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            field_type,
            required: false,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

fn object_schema(fields: &[SchemaField]) -> Value {
    let mut properties = Map::new();
    for f in fields {
        let mut schema = f.field_type.to_json_schema();
        if !f.description.is_empty() {
            if let Some(obj) = schema.as_object_mut() {
                obj.insert("description".into(), Value::String(f.description.clone()));
            }
        }
        properties.insert(f.name.clone(), schema);
    }
    let required: Vec<&str> = fields
        .iter()
        .filter(|f| f.required)
        .map(|f| f.name.as_str())
        .collect();
    json!({"type": "object", "properties": properties, "required": required})
}

/// 本轮补全要求的结构化输出
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl OutputSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: SchemaField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn to_json_schema(&self) -> Value {
        object_schema(&self.fields)
    }

    /// 校验：顶层为对象、必填字段存在且非 null、已出现字段类型正确
    pub fn validate(&self, value: &Value) -> Result<(), CompletionError> {
        let obj = value.as_object().ok_or_else(|| {
            CompletionError::SchemaValidation(format!("{}: expected an object", self.name))
        })?;
        for f in &self.fields {
            match obj.get(&f.name) {
                None | Some(Value::Null) if f.required => {
                    return Err(CompletionError::SchemaValidation(format!(
                        "{}: missing required field '{}'",
                        self.name, f.name
                    )));
                }
                Some(v) if !v.is_null() && !f.field_type.check(v) => {
                    return Err(CompletionError::SchemaValidation(format!(
                        "{}: field '{}' has the wrong type",
                        self.name, f.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// 补全服务 trait
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// schema 为 None 时返回自由文本；否则返回通过校验的结构化对象
    async fn complete(
        &self,
        history: &[Message],
        system_prompt: &str,
        message: &str,
        schema: Option<&OutputSchema>,
    ) -> Result<Completion, CompletionError>;
}
