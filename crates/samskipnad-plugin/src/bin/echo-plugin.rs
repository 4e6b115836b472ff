//! Demo guest that echoes its input back.

use std::process::ExitCode;

use async_trait::async_trait;
use chrono::Utc;
use samskipnad_plugin::sdk::{self, BasePlugin, GuestPlugin};
use samskipnad_plugin::{PluginError, Value, ValueMap};

const DEFAULT_MESSAGE: &str = "Hello from Echo Plugin!";

struct EchoPlugin {
    base: BasePlugin,
}

#[async_trait]
impl GuestPlugin for EchoPlugin {
    fn base(&self) -> &BasePlugin {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePlugin {
        &mut self.base
    }

    async fn execute(&mut self, params: ValueMap) -> Result<ValueMap, PluginError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MESSAGE)
            .to_string();

        let mut reply = ValueMap::new();
        reply.insert("status".into(), "success".into());
        reply.insert("plugin".into(), self.name().into());
        reply.insert("version".into(), self.version().into());
        reply.insert("echo".into(), message.into());
        reply.insert("params_count".into(), params.len().into());
        reply.insert("params".into(), Value::Map(params));
        reply.insert("timestamp".into(), Utc::now().to_rfc3339().into());
        Ok(reply)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let plugin = EchoPlugin {
        base: BasePlugin::new("echo", "1.0.0"),
    };
    eprintln!("Starting Echo Plugin {} v{}", plugin.name(), plugin.version());
    sdk::run(plugin).await
}
