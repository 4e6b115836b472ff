//! Fault-injection guest for exercising host isolation.
//!
//! The `mode` parameter picks the behavior of each execute call:
//!
//! | mode           | behavior                                             |
//! |----------------|------------------------------------------------------|
//! | `echo`         | return the parameters unchanged (default)            |
//! | `sleep`        | wait `ms` milliseconds, then echo                    |
//! | `fail`         | report `message` as a plugin error                   |
//! | `hang`         | never reply                                          |
//! | `exit`         | terminate the process with `code` mid-call           |
//! | `publish`      | publish `event` with `payload` on the event bus      |
//! | `capabilities` | list the granted services                            |
//! | `stubborn`     | ignore the next shutdown request                     |

use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use samskipnad_plugin::sdk::{self, BasePlugin, GuestPlugin};
use samskipnad_plugin::{PluginError, Value, ValueMap};

struct FaultPlugin {
    base: BasePlugin,
    ignore_shutdown: bool,
}

impl FaultPlugin {
    async fn publish(&self, params: &ValueMap) -> Result<ValueMap, PluginError> {
        let bus = self
            .base
            .capabilities()
            .event_bus()
            .ok_or_else(|| PluginError::Execution("event_bus capability not granted".into()))?;

        let mut request = ValueMap::new();
        let event = params
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("fault.published");
        request.insert("event".into(), event.into());
        request.insert(
            "payload".into(),
            params.get("payload").cloned().unwrap_or_else(Value::empty_map),
        );

        let result = bus.call("publish", Value::Map(request)).await?;
        Ok(result.into_map().unwrap_or_default())
    }
}

#[async_trait]
impl GuestPlugin for FaultPlugin {
    fn base(&self) -> &BasePlugin {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePlugin {
        &mut self.base
    }

    async fn execute(&mut self, params: ValueMap) -> Result<ValueMap, PluginError> {
        let mode = params
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or("echo")
            .to_string();
        tracing::debug!(%mode, "fault execute");

        match mode.as_str() {
            "echo" => Ok(params),
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_f64).unwrap_or(0.0);
                tokio::time::sleep(Duration::from_millis(ms.max(0.0) as u64)).await;
                Ok(params)
            }
            "fail" => Err(PluginError::Execution(
                params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("fault failure")
                    .to_string(),
            )),
            "hang" => std::future::pending().await,
            "exit" => {
                let code = params.get("code").and_then(Value::as_f64).unwrap_or(3.0);
                std::process::exit(code as i32)
            }
            "publish" => self.publish(&params).await,
            "capabilities" => {
                let granted: Vec<Value> = self
                    .base
                    .capabilities()
                    .granted()
                    .into_iter()
                    .map(|service| Value::from(service.as_str()))
                    .collect();
                let mut reply = ValueMap::new();
                reply.insert("granted".into(), granted.into());
                Ok(reply)
            }
            "stubborn" => {
                self.ignore_shutdown = true;
                let mut reply = ValueMap::new();
                reply.insert("stubborn".into(), true.into());
                Ok(reply)
            }
            other => Err(PluginError::Execution(format!("unknown fault mode: {other}"))),
        }
    }

    async fn shutdown(&mut self) -> Result<(), PluginError> {
        if self.ignore_shutdown {
            tracing::warn!("ignoring shutdown request");
            std::future::pending::<()>().await;
        }
        tracing::info!(plugin = %self.name(), "fault shutting down");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let plugin = FaultPlugin {
        base: BasePlugin::new("fault", "0.1.0"),
        ignore_shutdown: false,
    };
    sdk::run(plugin).await
}
