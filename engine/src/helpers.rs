//! Deterministic, LLM-free transforms over the email corpus.
//!
//! These are the chunking, filtering, sorting, and aggregation primitives
//! programs compose with `llm_query`: chunk to keep sub-query context
//! small, group to focus analysis, summarise by truncation to stay under
//! context limits. All of them borrow from the corpus and never mutate it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::Timelike;
use regex::Regex;

use crate::corpus::Email;

/// Groups keyed by a string (sender, domain, date bucket, thread, window).
///
/// Ordered map so iteration order is stable across runs.
pub type EmailGroups<'a> = BTreeMap<String, Vec<&'a Email>>;

/// Parse an email date string (RFC-2822 first, then ISO fallbacks).
///
/// Real mail headers sometimes carry a day name that disagrees with the
/// date; the day-name part is dropped rather than trusted, so those still
/// parse.
pub fn parse_email_date(date_str: &str) -> Option<NaiveDateTime> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.naive_local());
    }
    let without_day = trimmed
        .split_once(", ")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    if let Ok(dt) = DateTime::parse_from_str(without_day, "%d %b %Y %H:%M:%S %z") {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    None
}

/// Extract the bare address from a `Name <addr@host>` from-field, lowercased.
fn sender_address(from_field: &str) -> String {
    let bracketed = Regex::new(r"<([^>]+)>").expect("static regex");
    match bracketed.captures(from_field) {
        Some(captures) => captures[1].to_lowercase(),
        None => from_field.trim().to_lowercase(),
    }
}

fn sender_of(email: &Email) -> String {
    if email.from.is_empty() {
        "(unknown)".to_string()
    } else {
        sender_address(&email.from)
    }
}

/// Split into fixed-size chunks for batch processing.
pub fn chunk_by_size(emails: &[Email], chunk_size: usize) -> Vec<Vec<&Email>> {
    emails
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Group by sender address.
pub fn chunk_by_sender(emails: &[Email]) -> EmailGroups<'_> {
    let mut groups = EmailGroups::new();
    for email in emails {
        groups.entry(sender_of(email)).or_default().push(email);
    }
    groups
}

/// Group by sender domain (the part after `@`, or `unknown`).
pub fn chunk_by_sender_domain(emails: &[Email]) -> EmailGroups<'_> {
    let mut groups = EmailGroups::new();
    for email in emails {
        let address = sender_of(email);
        let domain = match address.split_once('@') {
            Some((_, domain)) => domain.to_string(),
            None => "unknown".to_string(),
        };
        groups.entry(domain).or_default().push(email);
    }
    groups
}

/// Date grouping granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatePeriod {
    Day,
    Week,
    Month,
}

impl DatePeriod {
    fn key(self, dt: NaiveDateTime) -> String {
        match self {
            Self::Day => dt.format("%Y-%m-%d").to_string(),
            Self::Week => dt.format("%Y-W%W").to_string(),
            Self::Month => dt.format("%Y-%m").to_string(),
        }
    }
}

impl std::str::FromStr for DatePeriod {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(()),
        }
    }
}

/// Group by date period; unparsable dates land under `unknown_date`.
pub fn chunk_by_date(emails: &[Email], period: DatePeriod) -> EmailGroups<'_> {
    let mut groups = EmailGroups::new();
    for email in emails {
        let key = match parse_email_date(&email.date) {
            Some(dt) => period.key(dt),
            None => "unknown_date".to_string(),
        };
        groups.entry(key).or_default().push(email);
    }
    groups
}

/// Group by thread id, falling back to the message id.
pub fn chunk_by_thread(emails: &[Email]) -> EmailGroups<'_> {
    let mut groups = EmailGroups::new();
    for email in emails {
        let key = if !email.thread_id.is_empty() {
            email.thread_id.clone()
        } else if !email.id.is_empty() {
            email.id.clone()
        } else {
            "unknown".to_string()
        };
        groups.entry(key).or_default().push(email);
    }
    groups
}

/// Group into fixed time windows for burst correlation.
///
/// A message at 10:23 with a 5-minute window lands in the 10:20 bucket.
/// Unparsable dates land under `unknown_time`.
pub fn chunk_by_time_window(emails: &[Email], window_minutes: u32) -> EmailGroups<'_> {
    let window = window_minutes.max(1);
    let mut groups = EmailGroups::new();
    for email in emails {
        let key = match parse_email_date(&email.date) {
            Some(dt) => {
                let zeroed = dt.with_second(0).and_then(|dt| dt.with_nanosecond(0));
                match zeroed.and_then(|dt| {
                    let offset = dt.minute() % window;
                    dt.with_minute(dt.minute() - offset)
                }) {
                    Some(start) => start.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    None => "unknown_time".to_string(),
                }
            }
            None => "unknown_time".to_string(),
        };
        groups.entry(key).or_default().push(email);
    }
    groups
}

/// Keep emails matching an arbitrary predicate.
pub fn filter_emails<'a, F>(emails: &'a [Email], predicate: F) -> Vec<&'a Email>
where
    F: Fn(&Email) -> bool,
{
    emails.iter().filter(|email| predicate(email)).collect()
}

const DEFAULT_KEYWORD_FIELDS: [&str; 3] = ["subject", "snippet", "body"];

fn field_value<'a>(email: &'a Email, field: &str) -> &'a str {
    match field {
        "id" => &email.id,
        "threadId" | "thread_id" => &email.thread_id,
        "subject" => &email.subject,
        "from" => &email.from,
        "to" => &email.to,
        "date" => &email.date,
        "snippet" => &email.snippet,
        "body" => &email.body,
        _ => "",
    }
}

/// Keep emails containing a keyword (case-insensitive) in the given fields,
/// subject/snippet/body by default.
pub fn filter_by_keyword<'a>(
    emails: &'a [Email],
    keyword: &str,
    fields: Option<&[&str]>,
) -> Vec<&'a Email> {
    let keyword = keyword.to_lowercase();
    let fields = fields.unwrap_or(&DEFAULT_KEYWORD_FIELDS);
    filter_emails(emails, |email| {
        fields
            .iter()
            .any(|field| field_value(email, field).to_lowercase().contains(&keyword))
    })
}

/// Keep emails whose from-field contains the pattern (case-insensitive).
pub fn filter_by_sender<'a>(emails: &'a [Email], sender_pattern: &str) -> Vec<&'a Email> {
    let pattern = sender_pattern.to_lowercase();
    filter_emails(emails, |email| {
        email.from.to_lowercase().contains(&pattern)
    })
}

/// Sort by a field; dates sort chronologically when they parse.
pub fn sort_emails<'a>(emails: &'a [Email], by: &str, reverse: bool) -> Vec<&'a Email> {
    let mut sorted: Vec<&Email> = emails.iter().collect();
    if by == "date" {
        sorted.sort_by_key(|email| {
            (
                parse_email_date(&email.date),
                email.date.clone(),
            )
        });
    } else {
        sorted.sort_by_key(|email| field_value(email, by).to_lowercase());
    }
    if reverse {
        sorted.reverse();
    }
    sorted
}

/// Top N senders by message count, ties broken alphabetically.
pub fn top_senders(emails: &[Email], n: usize) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = chunk_by_sender(emails)
        .into_iter()
        .map(|(sender, messages)| (sender, messages.len()))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(n);
    counts
}

/// Concise one-email summary for LLM context.
pub fn email_summary(email: &Email) -> String {
    let mut parts = Vec::new();
    if !email.from.is_empty() {
        parts.push(format!("From: {}", email.from));
    }
    if !email.subject.is_empty() {
        parts.push(format!("Subject: {}", email.subject));
    }
    if !email.date.is_empty() {
        parts.push(format!("Date: {}", email.date));
    }
    if !email.snippet.is_empty() {
        parts.push(format!("Preview: {}", email.snippet));
    }
    parts.join("\n")
}

/// Combined numbered summaries, truncated at `max_chars`.
///
/// When the cap is hit the output ends with a `... and N more emails` line
/// so the sub-query knows the context is partial.
pub fn batch_summaries(emails: &[&Email], max_chars: usize) -> String {
    let mut summaries = Vec::new();
    let mut total_chars = 0;

    for (i, email) in emails.iter().enumerate() {
        let summary = format!("[{}] {}", i + 1, email_summary(email));
        let summary_len = summary.len() + 2;
        if total_chars + summary_len > max_chars {
            summaries.push(format!("... and {} more emails", emails.len() - i));
            break;
        }
        total_chars += summary_len;
        summaries.push(summary);
    }

    summaries.join("\n\n")
}

/// Join non-empty sub-query results with a separator.
pub fn aggregate_results(results: &[String], separator: &str) -> String {
    results
        .iter()
        .map(|result| result.trim())
        .filter(|result| !result.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Drop duplicate messages by id; messages without an id are kept.
pub fn dedup_by_id(emails: &[Email]) -> Vec<&Email> {
    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    for email in emails {
        if email.id.is_empty() || seen.insert(email.id.as_str()) {
            result.push(email);
        }
    }
    result
}

/// Word-level Jaccard similarity between two signatures.
fn text_similarity(a: &str, b: &str) -> f64 {
    let words_a: BTreeSet<&str> = a.split_whitespace().collect();
    let words_b: BTreeSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Normalised signature of an alert: subject and snippet head with digit
/// runs collapsed to `N`, so the same finding across 50 hosts or ports
/// produces the same signature.
pub fn alert_signature(email: &Email) -> String {
    let digits = Regex::new(r"\d+").expect("static regex");
    let subject = digits
        .replace_all(&email.subject.to_lowercase(), "N")
        .into_owned();
    let snippet = digits
        .replace_all(&email.snippet.to_lowercase(), "N")
        .into_owned();
    let snippet_head: String = snippet.chars().take(100).collect();
    format!("{subject}|{snippet_head}")
}

/// Near-duplicate consolidation for recurring alerts.
///
/// Candidates whose signatures match a kept alert at or above the
/// similarity threshold are dropped. 0.9 is the conventional threshold.
pub fn dedup_similar(emails: &[Email], similarity_threshold: f64) -> Vec<&Email> {
    let mut unique = Vec::new();
    let mut seen_signatures: Vec<String> = Vec::new();

    for email in emails {
        let signature = alert_signature(email);
        let duplicate = seen_signatures
            .iter()
            .any(|seen| text_similarity(&signature, seen) >= similarity_threshold);
        if !duplicate {
            unique.push(email);
            seen_signatures.push(signature);
        }
    }

    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn email(id: &str, from: &str, date: &str, subject: &str, snippet: &str) -> Email {
        Email {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            from: from.to_string(),
            date: date.to_string(),
            subject: subject.to_string(),
            snippet: snippet.to_string(),
            ..Email::default()
        }
    }

    fn sample() -> Vec<Email> {
        vec![
            email(
                "1",
                "Alice <a@x.com>",
                "Thu, 15 Jan 2026 10:30:00 -0800",
                "Quarterly report",
                "please review the numbers",
            ),
            email(
                "2",
                "a@x.com",
                "Fri, 16 Jan 2026 09:00:00 -0800",
                "Re: Quarterly report",
                "thanks, looks urgent",
            ),
            email(
                "3",
                "Bob <b@y.org>",
                "2026-01-20",
                "Lunch",
                "pizza on friday?",
            ),
        ]
    }

    #[test]
    fn date_parsing_accepts_rfc2822_and_iso() {
        assert!(parse_email_date("Thu, 15 Jan 2026 10:30:00 -0800").is_some());
        assert!(parse_email_date("15 Jan 2026 10:30:00 -0800").is_some());
        // A header with the wrong day name still parses.
        assert!(parse_email_date("Mon, 15 Jan 2026 10:30:00 -0800").is_some());
        assert!(parse_email_date("2026-01-15 10:30:00").is_some());
        assert!(parse_email_date("2026-01-15T10:30:00").is_some());
        assert!(parse_email_date("2026-01-15").is_some());
        assert!(parse_email_date("next tuesday").is_none());
        assert!(parse_email_date("").is_none());
    }

    #[test]
    fn chunking_by_size_preserves_order() {
        let emails = sample();
        let chunks = chunk_by_size(&emails, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(chunks[0][0].id, "1");
        assert_eq!(chunks[1][0].id, "3");
        // Zero chunk size is clamped rather than panicking.
        assert_eq!(chunk_by_size(&emails, 0).len(), 3);
    }

    #[test]
    fn sender_grouping_extracts_bracketed_address() {
        let emails = sample();
        let groups = chunk_by_sender(&emails);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["a@x.com"].len(), 2);
        assert_eq!(groups["b@y.org"].len(), 1);
    }

    #[test]
    fn domain_grouping() {
        let emails = sample();
        let groups = chunk_by_sender_domain(&emails);
        assert_eq!(groups["x.com"].len(), 2);
        assert_eq!(groups["y.org"].len(), 1);
    }

    #[test]
    fn date_grouping_by_day_and_month() {
        let emails = sample();
        let by_day = chunk_by_date(&emails, DatePeriod::Day);
        assert_eq!(by_day["2026-01-15"].len(), 1);
        assert_eq!(by_day["2026-01-16"].len(), 1);
        assert_eq!(by_day["2026-01-20"].len(), 1);

        let by_month = chunk_by_date(&emails, DatePeriod::Month);
        assert_eq!(by_month["2026-01"].len(), 3);
    }

    #[test]
    fn unparsable_dates_group_separately() {
        let emails = vec![email("1", "a@x.com", "not a date", "s", "p")];
        let groups = chunk_by_date(&emails, DatePeriod::Day);
        assert_eq!(groups["unknown_date"].len(), 1);
    }

    #[test]
    fn thread_grouping_falls_back_to_id() {
        let mut emails = sample();
        emails[2].thread_id.clear();
        let groups = chunk_by_thread(&emails);
        assert_eq!(groups["t-1"].len(), 1);
        assert_eq!(groups["3"].len(), 1);
    }

    #[test]
    fn time_windows_round_down() {
        let emails = vec![
            email("1", "a@x.com", "2026-01-15 10:23:45", "alert", "x"),
            email("2", "a@x.com", "2026-01-15 10:24:10", "alert", "y"),
            email("3", "a@x.com", "2026-01-15 10:26:00", "alert", "z"),
        ];
        let windows = chunk_by_time_window(&emails, 5);
        assert_eq!(windows["2026-01-15T10:20:00"].len(), 2);
        assert_eq!(windows["2026-01-15T10:25:00"].len(), 1);
    }

    #[test]
    fn keyword_filter_is_case_insensitive() {
        let emails = sample();
        let hits = filter_by_keyword(&emails, "URGENT", None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "2");

        let subject_only = filter_by_keyword(&emails, "urgent", Some(&["subject"]));
        assert!(subject_only.is_empty());
    }

    #[test]
    fn sender_filter_matches_substring() {
        let emails = sample();
        assert_eq!(filter_by_sender(&emails, "@x.com").len(), 2);
        assert_eq!(filter_by_sender(&emails, "bob").len(), 1);
        assert!(filter_by_sender(&emails, "@z.net").is_empty());
    }

    #[test]
    fn date_sort_is_chronological() {
        let emails = sample();
        let ascending = sort_emails(&emails, "date", false);
        assert_eq!(
            ascending.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2", "3"]
        );
        let descending = sort_emails(&emails, "date", true);
        assert_eq!(descending[0].id, "3");
    }

    #[test]
    fn top_senders_counts_and_orders() {
        let emails = sample();
        let top = top_senders(&emails, 5);
        assert_eq!(top[0], ("a@x.com".to_string(), 2));
        assert_eq!(top[1], ("b@y.org".to_string(), 1));
        assert_eq!(top_senders(&emails, 1).len(), 1);
    }

    #[test]
    fn summary_skips_empty_fields() {
        let mut message = email("1", "a@x.com", "", "Hello", "world");
        message.date.clear();
        let summary = email_summary(&message);
        assert_eq!(summary, "From: a@x.com\nSubject: Hello\nPreview: world");
    }

    #[test]
    fn batch_summaries_truncate_with_tail_note() {
        let emails = sample();
        let refs: Vec<&Email> = emails.iter().collect();
        let all = batch_summaries(&refs, 10_000);
        assert!(all.contains("[1]"));
        assert!(all.contains("[3]"));
        assert!(!all.contains("more emails"));

        let truncated = batch_summaries(&refs, 120);
        assert!(truncated.contains("more emails"));
    }

    #[test]
    fn aggregation_drops_empty_results() {
        let results = vec![
            "first".to_string(),
            "  ".to_string(),
            String::new(),
            "second".to_string(),
        ];
        assert_eq!(aggregate_results(&results, " | "), "first | second");
    }

    #[test]
    fn dedup_by_id_keeps_first_and_idless() {
        let mut emails = sample();
        emails.push(email("1", "dup@x.com", "", "dup", "dup"));
        emails.push(Email::default());
        let unique = dedup_by_id(&emails);
        assert_eq!(unique.len(), 4);
        assert_eq!(unique[0].from, "Alice <a@x.com>");
    }

    #[test]
    fn similar_alerts_collapse_across_numbers() {
        let emails = vec![
            email(
                "1",
                "scanner@soc.example",
                "",
                "CVE-2026-1111 found on host 10",
                "critical vulnerability detected on server 10 port 443",
            ),
            email(
                "2",
                "scanner@soc.example",
                "",
                "CVE-2026-1111 found on host 22",
                "critical vulnerability detected on server 22 port 8443",
            ),
            email(
                "3",
                "hr@corp.example",
                "",
                "Holiday party",
                "join us for snacks",
            ),
        ];
        let unique = dedup_similar(&emails, 0.9);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].id, "1");
        assert_eq!(unique[1].id, "3");
    }

    #[test]
    fn alert_signatures_collapse_digits() {
        let first = email("1", "ids@soc", "", "Scan from 10.0.0.1", "hit port 443");
        let second = email("2", "ids@soc", "", "Scan from 10.9.8.7", "hit port 8080");
        assert_eq!(alert_signature(&first), alert_signature(&second));
        assert_eq!(alert_signature(&first), "scan from N.N.N.N|hit port N");
    }

    #[test]
    fn dissimilar_alerts_survive_dedup() {
        let emails = sample();
        assert_eq!(dedup_similar(&emails, 0.9).len(), 3);
    }

    #[test]
    fn empty_corpus_yields_empty_everything() {
        let emails: Vec<Email> = Vec::new();
        assert!(chunk_by_size(&emails, 5).is_empty());
        assert!(chunk_by_sender(&emails).is_empty());
        assert!(filter_by_keyword(&emails, "x", None).is_empty());
        assert!(top_senders(&emails, 3).is_empty());
        assert_eq!(batch_summaries(&[], 100), "");
        assert!(dedup_similar(&emails, 0.9).is_empty());
    }
}
