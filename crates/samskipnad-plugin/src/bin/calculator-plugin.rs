//! Demo guest doing basic arithmetic on two numbers.

use std::process::ExitCode;

use async_trait::async_trait;
use samskipnad_plugin::sdk::{self, BasePlugin, GuestPlugin};
use samskipnad_plugin::{PluginError, Value, ValueMap};

struct CalculatorPlugin {
    base: BasePlugin,
}

fn calculate(operation: &str, a: f64, b: f64) -> Result<f64, PluginError> {
    match operation {
        "add" => Ok(a + b),
        "subtract" => Ok(a - b),
        "multiply" => Ok(a * b),
        "divide" if b == 0.0 => Err(PluginError::Execution("division by zero".into())),
        "divide" => Ok(a / b),
        other => Err(PluginError::Execution(format!(
            "unsupported operation: {other}"
        ))),
    }
}

#[async_trait]
impl GuestPlugin for CalculatorPlugin {
    fn base(&self) -> &BasePlugin {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePlugin {
        &mut self.base
    }

    async fn execute(&mut self, params: ValueMap) -> Result<ValueMap, PluginError> {
        let operation = params
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::Execution("operation parameter is required".into()))?;
        let (Some(a), Some(b)) = (
            params.get("a").and_then(Value::as_f64),
            params.get("b").and_then(Value::as_f64),
        ) else {
            return Err(PluginError::Execution(
                "parameters 'a' and 'b' must be numbers".into(),
            ));
        };

        let result = calculate(operation, a, b)?;

        let mut reply = ValueMap::new();
        reply.insert("status".into(), "success".into());
        reply.insert("plugin".into(), self.name().into());
        reply.insert("version".into(), self.version().into());
        reply.insert("operation".into(), operation.into());
        reply.insert("operands".into(), vec![Value::from(a), Value::from(b)].into());
        reply.insert("result".into(), result.into());
        reply.insert(
            "message".into(),
            format!("{a:.2} {operation} {b:.2} = {result:.2}").into(),
        );
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let plugin = CalculatorPlugin {
        base: BasePlugin::new("calculator", "1.0.0"),
    };
    eprintln!(
        "Starting Calculator Plugin {} v{}",
        plugin.name(),
        plugin.version()
    );
    sdk::run(plugin).await
}
