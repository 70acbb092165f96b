//! 网关入口：装配配置、存储、广播器和路由，然后启动服务。

use application::{
    ConnectionRegistry, EnvelopeCodec, EnvelopeDispatcher, FanoutBroadcaster, HeartbeatPolicy,
    PartitionMaintenance, PresenceStore, PubSubPublisher, SchemaLoader, SystemClock,
    spawn_partition_scheduler,
};
use config::GatewayConfig;
use infrastructure::{
    create_pg_pool, spawn_room_event_subscriber, PgMessageStore, PgPartitionStore,
    RedisPresenceStore, RedisPublisher,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from_env();
    config.validate()?;
    info!("配置加载完成");

    // PostgreSQL：消息持久化 + 分区管理面
    let pg_pool = create_pg_pool(&config.database).await?;
    sqlx::migrate!("../../migrations").run(&pg_pool).await?;
    info!("数据库迁移完成");

    // 信封编解码器：模式清单由后台任务异步加载，
    // 加载完成前所有入站信封都被拒绝
    let codec = Arc::new(EnvelopeCodec::new());
    let _schema_task = SchemaLoader::new(
        codec.schema_handle(),
        config.codec.schema_path.clone().map(PathBuf::from),
    )
    .spawn();

    // Redis：回退发布端、跨实例订阅端和在线状态
    let publisher: Arc<dyn PubSubPublisher> =
        Arc::new(RedisPublisher::connect(&config.redis.url).await?);
    let presence: Arc<dyn PresenceStore> =
        Arc::new(RedisPresenceStore::connect(&config.redis.url).await?);

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Arc::new(FanoutBroadcaster::new(
        Arc::clone(&registry),
        publisher,
        config.redis.room_channel_prefix.clone(),
    ));
    let _subscriber_task = spawn_room_event_subscriber(
        config.redis.url.clone(),
        config.redis.room_channel_prefix.clone(),
        Arc::clone(&broadcaster),
    );

    let clock = Arc::new(SystemClock);
    let dispatcher = Arc::new(EnvelopeDispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
        Arc::new(PgMessageStore::new(pg_pool.clone())),
        Arc::clone(&presence),
        clock.clone(),
    ));

    // 分区生命周期：定时轮转 + 清理
    let maintenance = Arc::new(PartitionMaintenance::new(
        Arc::new(PgPartitionStore::new(pg_pool.clone())),
        clock,
        config.partitions.retention_days,
    ));
    spawn_partition_scheduler(
        maintenance,
        config.partitions.interval_hours,
        config.partitions.enabled,
    );

    let state = AppState {
        registry,
        broadcaster,
        dispatcher,
        codec,
        presence,
        heartbeat: HeartbeatPolicy::from_config(&config.heartbeat),
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "网关已启动");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
