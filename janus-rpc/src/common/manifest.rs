/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Channel and command descriptions used to type-check arguments.
//!
//! A manifest is supplied already parsed; nothing here reads files.
//!
//! # Format
//!
//! ```json
//! {
//!   "version": "1.0.0",
//!   "name": "Inventory",
//!   "channels": {
//!     "default": {
//!       "commands": {
//!         "reserve": {
//!           "args": {
//!             "sku":   { "type": "string", "required": true, "pattern": "^[A-Z]{3}-\\d+$" },
//!             "count": { "type": "integer", "min": 1, "max": 10 },
//!             "mode":  { "type": "string", "enum": ["hold", "buy"] }
//!           },
//!           "response": { "type": "object" }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{Args, ErrorCode, StructuredError};

/// Root of a service description.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Manifest {
    /// Manifest version string.
    pub version: String,

    /// Service name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Service description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Channels by id.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelSpec>,

    /// Shared model definitions, carried verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Value>,
}

/// Commands available on one channel.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ChannelSpec {
    /// Channel description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Commands by name.
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,
}

/// One command's argument and response shape.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct CommandSpec {
    /// Command description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Accepted arguments by name. Anything else is rejected.
    #[serde(default)]
    pub args: BTreeMap<String, ArgumentSpec>,

    /// Response shape, carried verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    /// Error codes the command may produce.
    #[serde(default, alias = "errorCodes", skip_serializing_if = "Vec::is_empty")]
    pub error_codes: Vec<String>,
}

/// JSON type an argument must have.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    /// A JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON number without a fractional part.
    Integer,
    /// `true` or `false`.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
    /// Anything.
    #[default]
    Any,
}

impl ArgumentType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// Constraints on a single argument.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ArgumentSpec {
    /// Expected JSON type.
    #[serde(rename = "type", default)]
    pub kind: ArgumentType,

    /// Whether the argument must be present.
    #[serde(default)]
    pub required: bool,

    /// Value assumed when absent. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Permitted values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,

    /// Inclusive numeric lower bound.
    #[serde(default, alias = "minimum", skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Inclusive numeric upper bound.
    #[serde(default, alias = "maximum", skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Minimum string or array length.
    #[serde(default, alias = "minLength", skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    /// Maximum string or array length.
    #[serde(default, alias = "maxLength", skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    /// Regular expression a string must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Argument description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip)]
    compiled: CompiledPattern,
}

/// `pattern` compiled on first use. Derived state, so it never affects equality.
#[derive(Clone, Debug, Default)]
struct CompiledPattern(OnceLock<Regex>);

impl PartialEq for CompiledPattern {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            name: None,
            description: None,
            channels: BTreeMap::new(),
            models: None,
        }
    }
}

fn invalid(field: &str, message: String, value: &Value, constraints: Value) -> StructuredError {
    StructuredError::new(ErrorCode::InvalidArgument, message)
        .with_field(field)
        .with_value(value.clone())
        .with_constraints(constraints)
}

impl Manifest {
    /// Builds a manifest from an already-parsed JSON document.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ValidationFailed`] if the document does not describe a
    /// manifest or a `pattern` does not compile.
    pub fn from_value(value: Value) -> Result<Self, StructuredError> {
        let manifest: Self = serde_json::from_value(value).map_err(|e| {
            StructuredError::new(ErrorCode::ValidationFailed, format!("Invalid manifest: {e}"))
        })?;
        manifest.check()?;
        Ok(manifest)
    }

    /// Checks internal consistency: a non-empty version and compilable patterns.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ValidationFailed`] naming the offending entry.
    pub fn check(&self) -> Result<(), StructuredError> {
        if self.version.trim().is_empty() {
            return Err(
                StructuredError::new(ErrorCode::ValidationFailed, "Manifest version is empty")
                    .with_field("version"),
            );
        }
        for (channel, spec) in &self.channels {
            for (command, command_spec) in &spec.commands {
                for (arg, arg_spec) in &command_spec.args {
                    arg_spec.regex().map_err(|e| {
                        StructuredError::new(
                            ErrorCode::ValidationFailed,
                            format!("Invalid pattern for {channel}.{command}.{arg}: {e}"),
                        )
                        .with_field(arg.clone())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Looks up a command description.
    #[must_use]
    pub fn command(&self, channel: &str, command: &str) -> Option<&CommandSpec> {
        self.channels.get(channel)?.commands.get(command)
    }

    /// Type-checks `args` against the description of `command` on `channel`.
    ///
    /// Commands the manifest does not describe pass unchecked.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] for unknown or ill-typed arguments,
    /// [`ErrorCode::ValidationFailed`] for a missing required argument.
    pub fn validate_arguments(
        &self,
        channel: &str,
        command: &str,
        args: Option<&Args>,
    ) -> Result<(), StructuredError> {
        let Some(spec) = self.command(channel, command) else {
            return Ok(());
        };
        spec.validate(args)
    }
}

impl CommandSpec {
    /// Checks `args` against this command's argument table.
    ///
    /// # Errors
    ///
    /// See [`Manifest::validate_arguments`].
    pub fn validate(&self, args: Option<&Args>) -> Result<(), StructuredError> {
        if let Some(args) = args {
            if let Some(unknown) = args.keys().find(|name| !self.args.contains_key(*name)) {
                return Err(StructuredError::new(
                    ErrorCode::InvalidArgument,
                    format!("Unknown argument '{unknown}'"),
                )
                .with_field(unknown.clone()));
            }
        }

        for (name, spec) in &self.args {
            match args.and_then(|a| a.get(name)) {
                None | Some(Value::Null) if spec.required => {
                    return Err(StructuredError::new(
                        ErrorCode::ValidationFailed,
                        format!("Missing required argument '{name}'"),
                    )
                    .with_field(name.clone()));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.validate(name, value)?,
            }
        }
        Ok(())
    }
}

impl ArgumentSpec {
    /// The compiled `pattern`, cached after the first successful compile.
    /// A `pattern` changed since then is compiled afresh.
    fn regex(&self) -> Result<Option<Cow<'_, Regex>>, regex::Error> {
        let Some(pattern) = &self.pattern else {
            return Ok(None);
        };
        if let Some(regex) = self.compiled.0.get().filter(|r| r.as_str() == pattern) {
            return Ok(Some(Cow::Borrowed(regex)));
        }
        let regex = Regex::new(pattern)?;
        if self.compiled.0.get().is_none() {
            return Ok(Some(Cow::Borrowed(self.compiled.0.get_or_init(|| regex))));
        }
        Ok(Some(Cow::Owned(regex)))
    }

    /// Checks one value.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] carrying `field`, `value` and `constraints`.
    pub fn validate(&self, name: &str, value: &Value) -> Result<(), StructuredError> {
        if !self.kind.accepts(value) {
            return Err(invalid(
                name,
                format!("Argument '{name}' must be of type {}", self.kind.name()),
                value,
                json!({ "type": self.kind.name() }),
            ));
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(invalid(
                    name,
                    format!("Argument '{name}' is not one of the permitted values"),
                    value,
                    json!({ "enum": allowed }),
                ));
            }
        }

        if let Some(number) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| number < *min) {
                return Err(invalid(
                    name,
                    format!("Argument '{name}' must be at least {min}"),
                    value,
                    json!({ "min": min }),
                ));
            }
            if let Some(max) = self.max.filter(|max| number > *max) {
                return Err(invalid(
                    name,
                    format!("Argument '{name}' must be at most {max}"),
                    value,
                    json!({ "max": max }),
                ));
            }
        }

        let length = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let Some(length) = length {
            if let Some(min_length) = self.min_length.filter(|min| length < *min) {
                return Err(invalid(
                    name,
                    format!("Argument '{name}' is shorter than {min_length}"),
                    value,
                    json!({ "min_length": min_length }),
                ));
            }
            if let Some(max_length) = self.max_length.filter(|max| length > *max) {
                return Err(invalid(
                    name,
                    format!("Argument '{name}' is longer than {max_length}"),
                    value,
                    json!({ "max_length": max_length }),
                ));
            }
        }

        if let (Some(pattern), Some(text)) = (&self.pattern, value.as_str()) {
            let regex = self.regex().map_err(|e| {
                StructuredError::new(
                    ErrorCode::ValidationFailed,
                    format!("Invalid pattern for argument '{name}': {e}"),
                )
                .with_field(name)
            })?;
            if !regex.is_some_and(|regex| regex.is_match(text)) {
                return Err(invalid(
                    name,
                    format!("Argument '{name}' does not match the required pattern"),
                    value,
                    json!({ "pattern": pattern }),
                ));
            }
        }
        Ok(())
    }
}
