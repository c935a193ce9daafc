use std::sync::Arc;
use std::sync::atomic::Ordering;

use outreach_engine::classify::ResponseClassifier;
use outreach_engine::clock::{Clock, SystemClock};
use outreach_engine::config::{DeliveryConfig, EngineConfig, MailboxConfig};
use outreach_engine::events::{EventIngestor, SchedulingHandler};
use outreach_engine::followup::{DueSweep, FollowUpScheduler, spawn_due_sweep};
use outreach_engine::http::{AppState, engine_routes};
use outreach_engine::inbound::SignalProcessor;
use outreach_engine::mailbox::{ImapTransport, InboxPoller, spawn_inbox_poller};
use outreach_engine::outbound::{
    ContentRenderer, HttpApiMailer, Mailer, Outbox, SmtpMailer, TemplateRenderer,
};
use outreach_engine::stage::StageTracker;
use outreach_engine::store::{Database, LibSqlBackend};
use outreach_engine::tracking::TrackingRewriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Logging: stderr plus a daily-rolled file kept for audit
    let log_dir = std::env::var("OUTREACH_LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "outreach-engine.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    // Fail fast on half-configured credentials before any loop starts
    let engine_config = EngineConfig::from_env();
    let mailbox_config = MailboxConfig::from_env();
    let delivery_config = DeliveryConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📬 Outreach Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   HTTP: http://0.0.0.0:{}", engine_config.http_port);
    eprintln!("   Database: {}", engine_config.db_path);
    eprintln!("   Cadence: {:?} days", engine_config.cadence_days);

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&engine_config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    engine_config.db_path, e
                );
                std::process::exit(1);
            }),
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tracker = Arc::new(StageTracker::new(Arc::clone(&db), Arc::clone(&clock)));
    let signals = Arc::new(SignalProcessor::new(
        Arc::clone(&db),
        ResponseClassifier::new(&engine_config.scheduling_domain),
        Arc::clone(&tracker),
        Arc::clone(&clock),
    ));
    let rewriter = Arc::new(TrackingRewriter::new(
        engine_config.tracking_base_url.clone(),
        engine_config.scheduling_domain.clone(),
    ));
    let booking_url = std::env::var("OUTREACH_BOOKING_URL")
        .unwrap_or_else(|_| format!("https://{}", engine_config.scheduling_domain));
    let renderer: Arc<dyn ContentRenderer> = Arc::new(TemplateRenderer::new(booking_url));

    // Outbound transport: the provider API when configured, SMTP otherwise
    let mailer: Arc<dyn Mailer> = if let Some(delivery) = delivery_config {
        eprintln!("   Outbound: provider API ({})", delivery.domain);
        Arc::new(HttpApiMailer::new(delivery))
    } else if let Some(mailbox) = mailbox_config.clone() {
        eprintln!("   Outbound: SMTP ({})", mailbox.smtp_host);
        Arc::new(SmtpMailer::new(mailbox))
    } else {
        eprintln!("Error: no outbound transport configured.");
        eprintln!("  Set DELIVERY_DOMAIN / DELIVERY_API_KEY for the provider API,");
        eprintln!("  or EMAIL_IMAP_HOST / EMAIL_PASSWORD for SMTP.");
        std::process::exit(1);
    };

    let scheduler = Arc::new(FollowUpScheduler::new(
        Arc::clone(&db),
        engine_config.cadence_days.clone(),
    ));
    let outbox = Arc::new(Outbox::new(
        Arc::clone(&db),
        Arc::clone(&mailer),
        Arc::clone(&rewriter),
        scheduler,
        Arc::clone(&tracker),
        Arc::clone(&clock),
    ));
    let ingestor = Arc::new(EventIngestor::new(
        Arc::clone(&db),
        Arc::clone(&clock),
        engine_config.timestamp_policy,
    ));
    let scheduling = Arc::new(SchedulingHandler::new(
        Arc::clone(&tracker),
        Arc::clone(&mailer),
        Arc::clone(&renderer),
        Arc::clone(&db),
        Arc::clone(&clock),
    ));

    let mut shutdown_flags = Vec::new();

    // Inbox poller, only when a mailbox is configured
    if let Some(mailbox) = mailbox_config {
        eprintln!(
            "   Inbox: polling {} every {}s",
            mailbox.imap_host, engine_config.poll_interval_secs
        );
        let transport = Arc::new(ImapTransport::new(mailbox));
        let poller = Arc::new(InboxPoller::new(transport, Arc::clone(&signals)));
        let (_poll_handle, poll_flag) =
            spawn_inbox_poller(poller, engine_config.poll_interval_secs);
        shutdown_flags.push(poll_flag);
    } else {
        eprintln!("   Inbox: disabled (EMAIL_IMAP_HOST unset)");
    }

    // Follow-up due-sweep
    let sweep = Arc::new(DueSweep::new(
        Arc::clone(&db),
        Arc::clone(&clock),
        Arc::clone(&mailer),
        Arc::clone(&renderer),
        Arc::clone(&rewriter),
    ));
    let (_sweep_handle, sweep_flag) = spawn_due_sweep(sweep, engine_config.sweep_interval_secs);
    shutdown_flags.push(sweep_flag);

    // Tracking + webhook HTTP surface
    let state = AppState {
        db,
        clock,
        policy: engine_config.timestamp_policy,
        ingestor,
        scheduling,
        signals,
        outbox,
    };
    let app = engine_routes(state);
    let port = engine_config.http_port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tokio::spawn(async move {
        tracing::info!(port, "HTTP server started");
        axum::serve(listener, app).await.ok();
    });

    // Ctrl-C stops scheduling new poll/sweep iterations; in-flight sends
    // are allowed to complete
    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down");
    for flag in &shutdown_flags {
        flag.store(true, Ordering::Relaxed);
    }
    tracing::info!("Shutdown flags set, exiting");

    Ok(())
}
