use agora::bus::types::Bus;
use agora::calendar::actor::CalendarActor;
use agora::config::config::AppCfg;
use agora::core::types::Actor;
use agora::directory::provider::PgDirectory;
use agora::notify::actor::NotifierActor;
use agora::persistence::database::Database;
use agora::scheduler::actor::SchedulerActor;
use agora::settlement::actor::SettlementActor;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let cfg = AppCfg::load("config.yml")?;

    // Root span for the supervisor/main thread
    let span = info_span!(
        "Supervisor",
        pid = %std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
    );

    let _enter = span.enter();

    info!("Starting up");

    info!("Connecting to database");
    let db = Database::new(&cfg.database.url, cfg.database.max_connections).await?;

    info!("Initializing shared pub/sub Bus");
    let bus = Bus::new();
    let shutdown = CancellationToken::new();

    info!("Building actors");
    let sched = SchedulerActor::new(
        bus.clone(),
        db.clone(),
        cfg.scheduler.clone(),
        shutdown.clone(),
    );
    let directory = PgDirectory::new(db.pool.clone());
    let settle = SettlementActor::new(
        bus.clone(),
        db.clone(),
        directory,
        cfg.prediction.clone(),
        shutdown.clone(),
    );
    let cal = CalendarActor::new(bus.clone(), db.clone(), shutdown.clone());
    let notifier = NotifierActor::new(bus.clone(), db.clone(), shutdown.clone());

    info!("Spawning actors");
    let mut actors = tokio::task::JoinSet::new();

    actors.spawn(sched.run().instrument(info_span!("Scheduler")));
    actors.spawn(settle.run().instrument(info_span!("Settlement")));
    actors.spawn(cal.run().instrument(info_span!("Calendar")));
    actors.spawn(notifier.run().instrument(info_span!("Notifier")));

    info!("Waiting for actors");

    tokio::select! {
        _ = async {
             while let Some(res) = actors.join_next().await {
                 match res {
                    Ok(Ok(()))  => info!("Actor exited cleanly"),
                    Ok(Err(e))  => error!(?e, "Actor returned error"),
                    Err(panic)  => error!(?panic, "Actor panicked/cancelled"),
                }
            }
        } => {  }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down supervisor loop");
            shutdown.cancel();
        }
    }

    info!("Waiting for graceful shutdown of actors");
    while let Some(res) = actors.join_next().await {
        match res {
            Ok(Ok(())) => info!("Actor exited cleanly"),
            Ok(Err(e)) => error!(?e, "Actor returned error"),
            Err(panic) => error!(?panic, "Actor panicked/cancelled"),
        }
    }

    info!("Supervisor exit");
    Ok(())
}
