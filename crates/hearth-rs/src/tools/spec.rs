//! Structured tool descriptions with usage guidance.
//!
//! `ToolSpec` turns purpose, when-to-use and when-not-to-use guidance plus
//! examples into the single description string the model sees. Models pick
//! tools more reliably from this shape than from one free-form sentence.

use crate::ToolDef;

/// A structured tool specification.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Tool name (must be unique within a ToolSet).
    pub name: String,
    /// One-sentence imperative purpose.
    pub purpose: String,
    pub when_to_use: Option<String>,
    /// When this tool should NOT be used (prevents confusion with similar tools).
    pub when_not_to_use: Option<String>,
    pub parameters: serde_json::Value,
    /// Usage examples as (input, expected output) pairs.
    pub examples: Vec<(String, String)>,
    pub output_format: Option<String>,
}

impl ToolSpec {
    pub fn builder(name: impl Into<String>) -> ToolSpecBuilder {
        ToolSpecBuilder {
            spec: ToolSpec {
                name: name.into(),
                purpose: String::new(),
                when_to_use: None,
                when_not_to_use: None,
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                examples: Vec::new(),
                output_format: None,
            },
        }
    }

    /// Render the description string sent to the model.
    pub fn to_description(&self) -> String {
        let mut desc = format!("{}.", self.purpose.trim_end_matches('.'));
        if let Some(when) = &self.when_to_use {
            desc.push_str(&format!("\nWhen to use: {when}"));
        }
        if let Some(when_not) = &self.when_not_to_use {
            desc.push_str(&format!("\nWhen NOT to use: {when_not}"));
        }
        if !self.examples.is_empty() {
            desc.push_str("\nExamples:");
            for (input, output) in &self.examples {
                desc.push_str(&format!("\n  - Input: {input} -> {output}"));
            }
        }
        if let Some(format) = &self.output_format {
            desc.push_str(&format!("\nOutput format: {format}"));
        }
        desc
    }

    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef::new(self.name.clone(), self.to_description(), self.parameters.clone())
    }
}

pub struct ToolSpecBuilder {
    spec: ToolSpec,
}

impl ToolSpecBuilder {
    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.spec.purpose = purpose.into();
        self
    }

    pub fn when_to_use(mut self, when: impl Into<String>) -> Self {
        self.spec.when_to_use = Some(when.into());
        self
    }

    pub fn when_not_to_use(mut self, when_not: impl Into<String>) -> Self {
        self.spec.when_not_to_use = Some(when_not.into());
        self
    }

    pub fn parameters(mut self, params: serde_json::Value) -> Self {
        self.spec.parameters = params;
        self
    }

    /// Derive JSON Schema parameters from a type implementing `schemars::JsonSchema`,
    /// so the schema and the deserialization logic can never diverge.
    pub fn parameters_for<T: schemars::JsonSchema>(self) -> Self {
        self.parameters(crate::json_schema_for::<T>())
    }

    pub fn example(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.spec.examples.push((input.into(), output.into()));
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.spec.output_format = Some(format.into());
        self
    }

    pub fn build(self) -> ToolSpec {
        self.spec
    }

    /// Shortcut for `.build().to_tool_def()`.
    pub fn to_tool_def(self) -> ToolDef {
        self.spec.to_tool_def()
    }
}
