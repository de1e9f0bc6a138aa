#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use quire_engine::{
    Command, CommandError, EngineConfig, ModelId, ModelManager, Patch, SimpleCommand,
    UpdateModelCommand,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn manager_with(models: &[(&str, Value)]) -> ModelManager {
    manager_with_config(EngineConfig::default(), models)
}

pub fn manager_with_config(config: EngineConfig, models: &[(&str, Value)]) -> ModelManager {
    init_tracing();
    let manager = ModelManager::new(config);
    for (id, model) in models {
        manager.set_model(*id, model.clone()).unwrap();
    }
    manager
}

pub fn value_of(manager: &ModelManager, id: &str) -> Value {
    manager.get_model(&ModelId::from(id)).unwrap()["value"].clone()
}

pub fn add(model_id: &str, by: i64) -> Command {
    Command::simple(UpdateModelCommand::new("Add", model_id, move |model| {
        let value = model["value"].as_i64().unwrap_or_default();
        model["value"] = json!(value + by);
        Ok(())
    }))
}

pub fn divide(model_id: &str, by: i64) -> Command {
    Command::simple(UpdateModelCommand::new("Divide", model_id, move |model| {
        let value = model["value"].as_i64().unwrap_or_default();
        model["value"] = json!(value / by);
        Ok(())
    }))
}

pub fn set(model_id: &str, field: &str, value: Value) -> Command {
    let field = field.to_string();
    Command::simple(UpdateModelCommand::new(
        format!("Set {field}"),
        model_id,
        move |model| {
            model[field.as_str()] = value.clone();
            Ok(())
        },
    ))
}

/// Mutates its working copy, then fails
#[derive(Debug)]
pub struct FailingCommand {
    model_id: ModelId,
}

impl FailingCommand {
    pub fn command(model_id: &str) -> Command {
        Command::simple(Self {
            model_id: ModelId::from(model_id),
        })
    }
}

#[async_trait]
impl SimpleCommand for FailingCommand {
    fn label(&self) -> &str {
        "Fail"
    }

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        model["value"] = json!(-1);
        Err(CommandError::Failed("boom".to_string()))
    }

    async fn undo(&self, _model: &mut Value) -> Result<Option<Patch>, CommandError> {
        Err(CommandError::Failed("boom".to_string()))
    }

    async fn redo(&self, _model: &mut Value) -> Result<Option<Patch>, CommandError> {
        Err(CommandError::Failed("boom".to_string()))
    }
}

/// Executes once and refuses to be undone
#[derive(Debug)]
pub struct PermanentCommand {
    model_id: ModelId,
    value: Value,
}

impl PermanentCommand {
    pub fn command(model_id: &str, value: Value) -> Command {
        Command::simple(Self {
            model_id: ModelId::from(model_id),
            value,
        })
    }
}

#[async_trait]
impl SimpleCommand for PermanentCommand {
    fn label(&self) -> &str {
        "Permanent"
    }

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn can_undo(&self, _model: &Value) -> bool {
        false
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        let before = model.clone();
        model["value"] = self.value.clone();
        Ok(Some(quire_patch::diff(&before, model)))
    }

    async fn undo(&self, _model: &mut Value) -> Result<Option<Patch>, CommandError> {
        Err(CommandError::Failed("permanent".to_string()))
    }

    async fn redo(&self, _model: &mut Value) -> Result<Option<Patch>, CommandError> {
        Err(CommandError::Failed("permanent".to_string()))
    }
}

/// Sets `value`, then parks until released
#[derive(Debug)]
pub struct GatedCommand {
    model_id: ModelId,
    value: Value,
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl GatedCommand {
    pub fn new(model_id: &str, value: Value) -> Self {
        Self {
            model_id: ModelId::from(model_id),
            value,
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl SimpleCommand for GatedCommand {
    fn label(&self) -> &str {
        "Gated"
    }

    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        let before = model.clone();
        model["value"] = self.value.clone();
        self.started.notify_one();
        self.release.notified().await;
        Ok(Some(quire_patch::diff(&before, model)))
    }

    async fn undo(&self, _model: &mut Value) -> Result<Option<Patch>, CommandError> {
        Ok(None)
    }

    async fn redo(&self, _model: &mut Value) -> Result<Option<Patch>, CommandError> {
        Ok(None)
    }
}

/// Adds to `value` like [`add`], but refuses to be redone
#[derive(Debug)]
pub struct UnrepeatableCommand {
    inner: UpdateModelCommand,
}

impl UnrepeatableCommand {
    pub fn command(model_id: &str, by: i64) -> Command {
        Command::simple(Self {
            inner: UpdateModelCommand::new("Unrepeatable", model_id, move |model| {
                let value = model["value"].as_i64().unwrap_or_default();
                model["value"] = json!(value + by);
                Ok(())
            }),
        })
    }
}

#[async_trait]
impl SimpleCommand for UnrepeatableCommand {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn model_id(&self) -> &ModelId {
        self.inner.model_id()
    }

    fn can_undo(&self, model: &Value) -> bool {
        self.inner.can_undo(model)
    }

    fn can_redo(&self, _model: &Value) -> bool {
        false
    }

    async fn execute(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.inner.execute(model).await
    }

    async fn undo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.inner.undo(model).await
    }

    async fn redo(&self, model: &mut Value) -> Result<Option<Patch>, CommandError> {
        self.inner.redo(model).await
    }
}
