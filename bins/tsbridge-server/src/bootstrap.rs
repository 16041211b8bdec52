use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tsbridge_api::{MessageBus, Store};
use tsbridge_engine::{
    BridgeConfig, BrokerConfig, DbConfig, Pipeline, ShutdownReport, Supervisor, TopicBinding, TopicConfig,
};
use tsbridge_schema_sensor_burst::SensorBurstSchema;
use tsbridge_schema_weather::WeatherSchema;
use tsbridge_storage_timescale::{PgConnectOptions, PoolSizing, TimescaleStore};
use tsbridge_transport_mqtt::{MqttBus, MqttSettings};

use crate::error::ServerError;

/// Resolve every configured topic to a pipeline. Fails on the first topic
/// whose schema is unknown or misconfigured.
pub fn build_pipelines(config: &BridgeConfig) -> Result<Vec<Box<dyn Pipeline>>, ServerError> {
    config.topics.iter().map(pipeline_for).collect()
}

fn pipeline_for(topic: &TopicConfig) -> Result<Box<dyn Pipeline>, ServerError> {
    match topic.schema.as_str() {
        "weather" => {
            if topic.accept.is_some() {
                return Err(ServerError::FilterUnsupported {
                    topic: topic.name.clone(),
                    schema: topic.schema.clone(),
                });
            }
            Ok(Box::new(TopicBinding::from_config(topic, WeatherSchema::new())))
        }
        "sensor_burst" | "rtl433" => {
            let schema = match &topic.accept {
                Some(signatures) => SensorBurstSchema::with_allow_list(signatures.iter().cloned()),
                None => SensorBurstSchema::new(),
            };
            Ok(Box::new(TopicBinding::from_config(topic, schema)))
        }
        other => Err(ServerError::UnknownSchema {
            topic: topic.name.clone(),
            schema: other.to_string(),
        }),
    }
}

pub fn connect_options(db: &DbConfig) -> (PgConnectOptions, PoolSizing) {
    let options = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .username(&db.user)
        .password(&db.password)
        .database(&db.database);
    let sizing = PoolSizing {
        min_connections: db.min_connections,
        max_connections: db.max_connections,
        acquire_timeout: Duration::from_secs(db.acquire_timeout_secs),
    };
    (options, sizing)
}

pub fn mqtt_settings(broker: &BrokerConfig) -> MqttSettings {
    let mut settings = MqttSettings::new(&broker.host, broker.port);
    settings.client_id = broker.client_id.clone();
    settings.keep_alive = Duration::from_secs(broker.keep_alive_secs);
    settings.qos = broker.qos;
    settings.channel_capacity = broker.channel_capacity;
    if let Some(username) = &broker.username {
        settings.credentials = Some((username.clone(), broker.password.clone().unwrap_or_default()));
    }
    settings
}

/// Run the supervised pipeline set against already-connected collaborators.
pub async fn serve(
    pipelines: Vec<Box<dyn Pipeline>>,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn Store>,
    shutdown: CancellationToken,
) -> Result<ShutdownReport, ServerError> {
    let supervisor = Supervisor::new(pipelines);
    tracing::info!(pipelines = supervisor.len(), "starting supervisor");
    Ok(supervisor.run(bus, store, shutdown).await?)
}

/// Connect to the database and the broker, then run until the first
/// pipeline task terminates or `shutdown` is cancelled.
pub async fn run(config: BridgeConfig, shutdown: CancellationToken) -> Result<ShutdownReport, ServerError> {
    let pipelines = build_pipelines(&config)?;

    let (options, sizing) = connect_options(&config.db);
    tracing::info!(host = %config.db.host, port = config.db.port, database = %config.db.database, "connecting to database");
    let store = Arc::new(TimescaleStore::connect(options, sizing).await?);

    tracing::info!(host = %config.broker.host, port = config.broker.port, "connecting to broker");
    let (bus, driver) = match MqttBus::connect(mqtt_settings(&config.broker)).await {
        Ok(connected) => connected,
        Err(e) => {
            store.close().await;
            return Err(e.into());
        }
    };
    let bus = Arc::new(bus);
    let driver_token = CancellationToken::new();
    let driver_task = tokio::spawn(driver.run(driver_token.clone()));

    let report = serve(pipelines, bus.clone(), store.clone(), shutdown).await;

    if let Err(e) = bus.disconnect().await {
        tracing::debug!(error = %e, "broker disconnect skipped");
    }
    driver_token.cancel();
    if let Err(e) = driver_task.await {
        tracing::warn!(error = %e, "mqtt driver did not stop cleanly");
    }
    store.close().await;

    report
}

/// Process exit code for a finished run: 1 if the trigger faulted.
pub fn exit_code(report: &ShutdownReport) -> i32 {
    if report.is_faulted() { 1 } else { 0 }
}
