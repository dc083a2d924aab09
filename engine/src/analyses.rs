//! Pre-built analyses.
//!
//! Ordinary `AnalysisProgram` callables composed from the helpers library
//! and the LLM entry points. No hidden state: given the same corpus,
//! governor state, and cache contents, each produces the same result.
//! Looked up by name so the driver can run them directly.

use std::sync::Arc;

use serde_json::json;

use crate::error::Result;
use crate::helpers::alert_signature;
use crate::helpers::batch_summaries;
use crate::helpers::chunk_by_date;
use crate::helpers::chunk_by_sender;
use crate::helpers::chunk_by_time_window;
use crate::helpers::dedup_by_id;
use crate::helpers::dedup_similar;
use crate::helpers::top_senders;
use crate::helpers::DatePeriod;
use crate::pipeline::QueryOptions;
use crate::pool::BatchItem;
use crate::runtime::AnalysisProgram;
use crate::runtime::ProgramEnv;

/// Emails per LLM sub-query chunk.
const TRIAGE_CHUNK_SIZE: usize = 20;
/// Context budget per sub-query, in characters.
const CONTEXT_MAX_CHARS: usize = 4000;
/// Correlation window for security alerts, in minutes.
const SECURITY_WINDOW_MINUTES: u32 = 5;
/// Similarity threshold for alert consolidation.
const ALERT_SIMILARITY_THRESHOLD: f64 = 0.9;
/// Sightings within the retention window that make a pattern recurring.
const RECURRING_OBSERVATIONS: usize = 3;

/// A named built-in analysis.
pub struct RegisteredAnalysis {
    pub name: &'static str,
    pub description: &'static str,
}

/// All built-in analyses, in presentation order.
pub fn builtin_analyses() -> Vec<RegisteredAnalysis> {
    vec![
        RegisteredAnalysis {
            name: "inbox_triage",
            description: "Categorise every email as urgent, needs_reply, or fyi",
        },
        RegisteredAnalysis {
            name: "sender_analysis",
            description: "Who emails most, and what about",
        },
        RegisteredAnalysis {
            name: "find_action_items",
            description: "Collect concrete action items and deadlines",
        },
        RegisteredAnalysis {
            name: "weekly_summary",
            description: "Summarise activity week by week",
        },
        RegisteredAnalysis {
            name: "security_triage",
            description: "Consolidate security alerts and analyse burst windows",
        },
    ]
}

/// Resolve a built-in analysis by name.
pub fn lookup(name: &str) -> Option<Arc<dyn AnalysisProgram>> {
    match name {
        "inbox_triage" => Some(Arc::new(inbox_triage as fn(&ProgramEnv) -> Result<()>)),
        "sender_analysis" => Some(Arc::new(sender_analysis as fn(&ProgramEnv) -> Result<()>)),
        "find_action_items" => Some(Arc::new(find_action_items as fn(&ProgramEnv) -> Result<()>)),
        "weekly_summary" => Some(Arc::new(weekly_summary as fn(&ProgramEnv) -> Result<()>)),
        "security_triage" => Some(Arc::new(security_triage as fn(&ProgramEnv) -> Result<()>)),
        _ => None,
    }
}

fn record_slot_errors(env: &ProgramEnv, label: &str, results: &[BatchItem]) {
    for (index, item) in results.iter().enumerate() {
        if let BatchItem::Error { error } = item {
            env.warn(format!("{label} chunk {index}: {} ({})", error.message, error.code));
        }
    }
}

fn inbox_triage(env: &ProgramEnv) -> Result<()> {
    let unique = dedup_by_id(env.emails());
    if unique.is_empty() {
        env.finalize_var("triage", &json!({"emails": 0, "chunks": 0, "assignments": []}));
        return Ok(());
    }

    let chunks: Vec<Vec<&crate::corpus::Email>> =
        unique.chunks(TRIAGE_CHUNK_SIZE).map(<[_]>::to_vec).collect();
    env.print(format!(
        "triaging {} emails in {} chunks",
        unique.len(),
        chunks.len()
    ));

    let results = env.parallel_map(
        "For each numbered email assign exactly one category: urgent, needs_reply, or fyi. \
         Reply with one line per email formatted as '<number>: <category>'.",
        &chunks,
        |chunk| batch_summaries(chunk, CONTEXT_MAX_CHARS),
        None,
    );
    record_slot_errors(env, "inbox_triage", &results);

    let assignments: Vec<&str> = results.iter().filter_map(BatchItem::as_success).collect();
    env.finalize_var(
        "triage",
        &json!({
            "emails": unique.len(),
            "chunks": chunks.len(),
            "assignments": assignments,
        }),
    );
    Ok(())
}

fn sender_analysis(env: &ProgramEnv) -> Result<()> {
    let emails = env.emails();
    let top = top_senders(emails, 10);
    if top.is_empty() {
        env.finalize("no senders found");
        return Ok(());
    }
    let groups = chunk_by_sender(emails);

    let mut lines = Vec::new();
    for (sender, count) in &top {
        lines.push(format!("{sender}: {count} messages"));
    }

    // A focused sub-query per heavy sender; the counts alone cover the rest.
    for (sender, count) in top.iter().take(3) {
        let Some(messages) = groups.get(sender) else {
            continue;
        };
        match env.llm_query(
            "What is this sender emailing about? Answer in one sentence.",
            &batch_summaries(messages, CONTEXT_MAX_CHARS),
        ) {
            Ok(summary) => lines.push(format!("{sender} ({count}): {summary}")),
            Err(err) => {
                env.warn(format!("sender_analysis: {sender}: {err}"));
                break;
            }
        }
    }

    env.finalize(lines.join("\n"));
    Ok(())
}

fn find_action_items(env: &ProgramEnv) -> Result<()> {
    let emails = env.emails();
    if emails.is_empty() {
        env.finalize("");
        return Ok(());
    }

    let refs: Vec<&crate::corpus::Email> = emails.iter().collect();
    let chunks: Vec<Vec<&crate::corpus::Email>> =
        refs.chunks(TRIAGE_CHUNK_SIZE).map(<[_]>::to_vec).collect();

    let results = env.parallel_map(
        "List every concrete action item in these emails with its owner and deadline, \
         one per line. Reply with exactly 'none' if there are none.",
        &chunks,
        |chunk| batch_summaries(chunk, CONTEXT_MAX_CHARS),
        None,
    );
    record_slot_errors(env, "find_action_items", &results);

    let items: Vec<String> = results
        .iter()
        .filter_map(BatchItem::as_success)
        .filter(|text| !text.trim().eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect();
    env.finalize(crate::helpers::aggregate_results(&items, "\n\n---\n\n"));
    Ok(())
}

fn weekly_summary(env: &ProgramEnv) -> Result<()> {
    let by_week = chunk_by_date(env.emails(), DatePeriod::Week);
    if by_week.is_empty() {
        env.finalize("");
        return Ok(());
    }

    let mut lines = Vec::new();
    for (week, messages) in &by_week {
        match env.llm_query(
            "Summarise this week's email activity in two sentences.",
            &batch_summaries(messages, CONTEXT_MAX_CHARS),
        ) {
            Ok(summary) => lines.push(format!("{week}: {summary}")),
            Err(err) => {
                env.warn(format!("weekly_summary: {week}: {err}"));
                lines.push(format!("{week}: ({} messages, not summarised)", messages.len()));
                break;
            }
        }
    }

    env.finalize(lines.join("\n"));
    Ok(())
}

fn security_triage(env: &ProgramEnv) -> Result<()> {
    let emails = env.emails();
    let unique = dedup_similar(emails, ALERT_SIMILARITY_THRESHOLD);
    env.print(format!(
        "consolidated {} alerts to {} unique",
        emails.len(),
        unique.len()
    ));

    let owned: Vec<crate::corpus::Email> = unique.iter().map(|email| (*email).clone()).collect();
    let windows = chunk_by_time_window(&owned, SECURITY_WINDOW_MINUTES);

    let options = QueryOptions {
        json_output: true,
        security_cache: true,
        ..QueryOptions::default()
    };

    let mut analysed = Vec::new();
    for (window, alerts) in &windows {
        let outcome = env.llm_query_with(
            "Classify the severity (P1-P5) of this alert window and name the likely attack \
             stage. Respond as a JSON object with keys severity, stage, reasoning.",
            &batch_summaries(alerts, CONTEXT_MAX_CHARS),
            options.clone(),
        );
        match outcome {
            Ok(analysis) => {
                // History across runs: a signature seen repeatedly within
                // the retention window marks the window as recurring.
                let recurring = env
                    .pattern_store()
                    .and_then(|store| {
                        let signature = alert_signature(alerts[0]);
                        store
                            .record(
                                &signature,
                                json!({"window": window, "alerts": alerts.len()}),
                            )
                            .ok()
                    })
                    .is_some_and(|history| history.observation_count >= RECURRING_OBSERVATIONS);
                analysed.push(json!({
                    "window": window,
                    "alerts": alerts.len(),
                    "recurring": recurring,
                    "analysis": analysis,
                }));
            }
            Err(err) => {
                env.warn(format!("security_triage: {window}: {err}"));
                break;
            }
        }
    }

    env.finalize_var(
        "security_triage",
        &json!({
            "total_alerts": emails.len(),
            "unique_alerts": owned.len(),
            "windows": analysed,
        }),
    );
    Ok(())
}
