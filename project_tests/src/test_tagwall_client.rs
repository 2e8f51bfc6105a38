//! Live subscriber for a running `server_tagwall`: registers tags, then
//! prints a per-tag delivery summary every interval.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket endpoint
    #[arg(short, long, default_value = "ws://127.0.0.1:9003/ws")]
    url: String,

    /// Tags to register, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "rust,tokio")]
    tags: Vec<String>,

    /// Report interval in minutes
    #[arg(short, long, default_value_t = 1)]
    report_interval_minutes: u64,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    tag_timestamps: HashMap<String, VecDeque<chrono::DateTime<Utc>>>,
    batches: usize,
}

impl Stats {
    fn record(&mut self, view: &serde_json::Value, wanted: &[String]) {
        let now = Utc::now();
        self.global_timestamps.push_back(now);
        let tags = view["tags"].as_array().cloned().unwrap_or_default();
        for tag in tags.iter().filter_map(|t| t.as_str()) {
            let tag = tag.to_lowercase();
            if wanted.contains(&tag) {
                self.tag_timestamps.entry(tag).or_default().push_back(now);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let wanted: Vec<String> = args.tags.iter().map(|t| t.to_lowercase()).collect();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_minutes * 60;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let one_minute_ago = Utc::now() - Duration::minutes(1);
            let mut data = stats_reporter.lock().unwrap();

            while data.global_timestamps.front().is_some_and(|&t| t < one_minute_ago) {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(String, usize)> = Vec::new();
            for (tag, dq) in data.tag_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < one_minute_ago) {
                    dq.pop_front();
                }
                if !dq.is_empty() {
                    rates.push((tag.clone(), dq.len()));
                }
            }
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let report = rates
                .iter()
                .map(|(t, r)| format!("#{}: {} items/min", t, r))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- 1-Minute Summary -----");
            println!("Global rate: {} items/min ({} search batches so far)", global_rate, data.batches);
            println!("Tags: {}", if report.is_empty() { "No data" } else { &report });
            println!("----------------------------\n");
        }
    });

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .context("Failed to connect")?;
    let (mut write, mut read) = ws_stream.split();

    for tag in &wanted {
        write
            .send(Message::Text(format!("REG {}", tag).into()))
            .await
            .context("Failed to send REG")?;
    }
    println!("Registered {:?}. Press Ctrl+C to stop.", wanted);

    while let Some(Ok(msg)) = read.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(text.as_str()) else {
            continue;
        };
        let mut data = stats.lock().unwrap();
        match payload {
            serde_json::Value::Array(views) => {
                data.batches += 1;
                for view in &views {
                    data.record(view, &wanted);
                }
            }
            view => data.record(&view, &wanted),
        }
    }

    println!("Server closed the connection.");
    Ok(())
}
