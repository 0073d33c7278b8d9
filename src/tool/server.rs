//! In-process tools and their builder

use super::stream::ToolOutputStream;
use super::ToolError;
use crate::error::{FlowError, Result};
use crate::events::{self, Event};
use crate::property::{resolve_values, Property, Values};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

/// Name of the output produced by a tool without a declared output
pub const TOOL_OUTPUT: &str = "tool_output";

type JsonHandler =
    Arc<dyn Fn(Values) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;
type StreamHandler =
    Arc<dyn Fn(Values) -> BoxStream<'static, Result<Value, ToolError>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Json(JsonHandler),
    Stream(StreamHandler),
}

/// A tool executed inside the engine process
#[derive(Clone)]
pub struct ServerTool {
    name: String,
    description: String,
    inputs: Vec<Property>,
    output: Property,
    requires_confirmation: bool,
    handler: Handler,
}

impl ServerTool {
    pub fn builder(name: impl Into<String>) -> ServerToolBuilder {
        ServerToolBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn inputs(&self) -> &[Property] {
        &self.inputs
    }

    pub fn output(&self) -> &Property {
        &self.output
    }

    pub fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.handler, Handler::Stream(_))
    }

    /// Run the tool on raw JSON arguments
    pub async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let args = self.resolve_args(args)?;
        let raw = match &self.handler {
            Handler::Json(handler) => handler(args).await?,
            Handler::Stream(handler) => {
                let name = self.name.clone();
                ToolOutputStream::new(&self.name, handler(args))
                    .finish(|index, chunk| {
                        events::emit(Event::ToolStreamChunk {
                            tool: name.clone(),
                            index,
                            chunk: chunk.clone(),
                        });
                    })
                    .await?
            }
        };
        if self.output.is_any() {
            return Ok(raw);
        }
        crate::property::cast(&raw, &self.output).map_err(|e| ToolError::Failed(e.to_string()))
    }

    /// Open the output stream of a streaming tool without draining it
    pub fn open_stream(&self, args: &Value) -> Result<ToolOutputStream, ToolError> {
        let args = self.resolve_args(args)?;
        match &self.handler {
            Handler::Stream(handler) => Ok(ToolOutputStream::new(&self.name, handler(args))),
            Handler::Json(_) => Err(ToolError::Failed(format!(
                "tool `{}` does not stream its output",
                self.name
            ))),
        }
    }

    fn resolve_args(&self, args: &Value) -> Result<Values, ToolError> {
        let provided: Values = match args {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::Null => Values::new(),
            other => {
                return Err(ToolError::Failed(format!(
                    "arguments must be an object, got {other}"
                )))
            }
        };
        resolve_values(&self.inputs, &provided)
            .map_err(|e| ToolError::Failed(format!("invalid arguments: {e}")))
    }
}

impl std::fmt::Debug for ServerTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTool")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("streaming", &self.is_streaming())
            .finish_non_exhaustive()
    }
}

/// Builder capturing a tool's schema and handler
pub struct ServerToolBuilder {
    name: String,
    description: String,
    inputs: Vec<Property>,
    output: Option<Property>,
    requires_confirmation: bool,
    handler: Option<Handler>,
}

impl ServerToolBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            output: None,
            requires_confirmation: false,
            handler: None,
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn input(mut self, property: Property) -> Self {
        self.inputs.push(property);
        self
    }

    #[must_use]
    pub fn inputs(mut self, properties: impl IntoIterator<Item = Property>) -> Self {
        self.inputs.extend(properties);
        self
    }

    #[must_use]
    pub fn output(mut self, property: Property) -> Self {
        self.output = Some(property);
        self
    }

    #[must_use]
    pub fn requires_confirmation(mut self, required: bool) -> Self {
        self.requires_confirmation = required;
        self
    }

    /// Handler over raw JSON arguments
    #[must_use]
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Some(Handler::Json(Arc::new(move |args| f(args).boxed())));
        self
    }

    /// Handler with deserialized arguments and a serializable output.
    ///
    /// An output that cannot be turned into JSON fails with
    /// [`ToolError::NonDuplicable`].
    #[must_use]
    pub fn typed_handler<I, O, F, Fut>(mut self, f: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handler = Some(Handler::Json(Arc::new(move |args: Values| {
            let f = Arc::clone(&f);
            async move {
                let object = Value::Object(args.into_iter().collect());
                let input: I = serde_json::from_value(object)
                    .map_err(|e| ToolError::Failed(format!("invalid arguments: {e}")))?;
                let output = f(input).await?;
                serde_json::to_value(&output).map_err(|e| ToolError::NonDuplicable(e.to_string()))
            }
            .boxed()
        })));
        self
    }

    /// Handler producing a stream of chunks; the last chunk is the result
    #[must_use]
    pub fn streaming_handler<F, S>(mut self, f: F) -> Self
    where
        F: Fn(Values) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Some(Handler::Stream(Arc::new(move |args| f(args).boxed())));
        self
    }

    pub fn build(self) -> Result<ServerTool> {
        if self.name.trim().is_empty() {
            return Err(FlowError::invalid_step("server tool", "tool name must not be empty"));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = self.inputs.iter().find(|p| !seen.insert(p.name.as_str())) {
            return Err(FlowError::invalid_step(
                &self.name,
                format!("duplicate input `{}`", dup.name),
            ));
        }
        let handler = self
            .handler
            .ok_or_else(|| FlowError::invalid_step(&self.name, "no handler configured"))?;
        Ok(ServerTool {
            output: self.output.unwrap_or_else(|| Property::any(TOOL_OUTPUT)),
            name: self.name,
            description: self.description,
            inputs: self.inputs,
            requires_confirmation: self.requires_confirmation,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn adder() -> ServerTool {
        ServerTool::builder("add")
            .description("Add two integers")
            .input(Property::integer("a"))
            .input(Property::integer("b").with_default(10))
            .output(Property::integer("sum"))
            .typed_handler(|args: AddArgs| async move { Ok(args.a + args.b) })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_typed_handler_fills_defaults() {
        let tool = adder();
        assert_eq!(tool.invoke(&json!({"a": 1, "b": 2})).await.unwrap(), json!(3));
        assert_eq!(tool.invoke(&json!({"a": "5"})).await.unwrap(), json!(15));
    }

    #[tokio::test]
    async fn test_missing_argument_fails() {
        let err = adder().invoke(&json!({"b": 2})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(msg) if msg.contains("`a`")));
    }

    #[tokio::test]
    async fn test_unserializable_output_is_non_duplicable() {
        let tool = ServerTool::builder("bad")
            .typed_handler(|_: serde_json::Map<String, Value>| async move {
                let mut out = BTreeMap::new();
                out.insert(vec![1u8], 1u8);
                Ok(out)
            })
            .build()
            .unwrap();
        let err = tool.invoke(&json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NonDuplicable(_)));
    }

    #[tokio::test]
    async fn test_streaming_handler_returns_last_chunk() {
        let tool = ServerTool::builder("progress")
            .streaming_handler(|_| stream::iter(vec![Ok(json!("10%")), Ok(json!("done"))]))
            .build()
            .unwrap();
        assert!(tool.is_streaming());
        assert_eq!(tool.invoke(&Value::Null).await.unwrap(), json!("done"));

        let mut s = tool.open_stream(&json!({})).unwrap();
        assert_eq!(s.next().await.unwrap().unwrap(), json!("10%"));
        assert!(adder().open_stream(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_builder_validation() {
        assert!(ServerTool::builder("noop").build().is_err());
        let dup = ServerTool::builder("dup")
            .input(Property::string("x"))
            .input(Property::integer("x"))
            .handler(|_| async { Ok(Value::Null) })
            .build();
        assert!(dup.is_err());
    }
}
