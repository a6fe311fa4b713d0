//! Hive CLI：单条请求驱动一次编排会话，结果以 JSON 打印

use hive::config::load_config;
use hive::core::WorkerProfile;
use hive::{Hive, InboundRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let request_text: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let request_text = if request_text.is_empty() {
        "Say hello.".to_string()
    } else {
        request_text
    };

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let hive = Hive::from_config(cfg)?
        .with_worker(WorkerProfile::new(
            "research",
            "You are a research worker. Gather the requested information and answer concisely.",
        ))
        .with_worker(WorkerProfile::new(
            "writer",
            "You are a writing worker. Draft the requested text based on seeded artifacts.",
        ));

    let outcome = hive
        .handle(InboundRequest {
            session_id: uuid::Uuid::new_v4().to_string(),
            principal_id: "cli".to_string(),
            request_text,
        })
        .await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
