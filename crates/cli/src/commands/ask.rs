//! `ciq ask` — answer one question, streaming events to the terminal.

use std::collections::BTreeSet;
use std::io::Write;

use anyhow::bail;
use ciq_core::filter::QueryFilters;
use ciq_core::provider::Usage;
use ciq_core::session::SessionId;
use ciq_engine::{CitationSource, QueryRequest, StatusStep, StreamEvent};

use crate::AskArgs;
use crate::runtime;

pub async fn run(args: AskArgs) -> anyhow::Result<()> {
    let config = runtime::load_config()?;
    let sessions = match args.session {
        Some(_) => Some(runtime::session_store(&config).await?),
        None => None,
    };
    let engine = runtime::build_engine(&config, sessions).await?;

    let mut request = build_request(&args);
    if config.memory.enabled {
        request = request.for_owner(config.sessions.owner.as_str());
    }
    let mut handle = engine.start(request);
    let mut view = AnswerView::new(args.json);
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                match view.render(&event) {
                    Some(Line::Out(text)) => {
                        write!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                    Some(Line::Err(text)) => eprintln!("{text}"),
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                let phase = handle.join().await;
                tracing::debug!(?phase, "Query stopped");
                eprintln!();
                eprintln!("  Cancelled.");
                return Ok(());
            }
        }
    }

    if let Some(message) = view.failure {
        bail!(message);
    }
    Ok(())
}

fn lowercase(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.trim().to_lowercase()).filter(|v| !v.is_empty()).collect()
}

pub fn build_request(args: &AskArgs) -> QueryRequest {
    let filters = QueryFilters {
        competitors: lowercase(&args.competitors),
        topics: lowercase(&args.topics),
        source_types: lowercase(&args.source_types),
        credibility: lowercase(&args.credibility),
        published_after: args.after,
        published_before: args.before,
    };

    let mut request = QueryRequest::new(args.text.join(" ")).with_filters(filters);
    if let Some(id) = &args.session {
        request = request.in_session(SessionId::from(id));
    }
    if let Some(n) = args.results {
        request = request.with_result_count(n);
    }
    if args.fast {
        request = request.fast();
    }
    if args.no_reasoning {
        request = request.without_reasoning();
    }
    request
}

#[derive(Debug, PartialEq)]
pub enum Line {
    Out(String),
    Err(String),
}

/// Turns the event stream into terminal output.
#[derive(Default)]
pub struct AnswerView {
    json: bool,
    sources: Vec<CitationSource>,
    cited: BTreeSet<usize>,
    followups: Vec<String>,
    usage: Option<Usage>,
    pub failure: Option<String>,
}

impl AnswerView {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            ..Default::default()
        }
    }

    pub fn render(&mut self, event: &StreamEvent) -> Option<Line> {
        if let StreamEvent::Error { kind, message } = event {
            self.failure = Some(format!("{kind}: {message}"));
        }
        if self.json {
            return serde_json::to_string(event).ok().map(|json| Line::Out(format!("{json}\n")));
        }

        match event {
            StreamEvent::Status {
                step,
                message,
                elapsed_ms,
                passages,
            } => Some(Line::Err(status_line(*step, message.as_deref(), *elapsed_ms, *passages))),
            StreamEvent::ThinkingDelta { .. } | StreamEvent::Metadata { .. } => None,
            StreamEvent::CitationSource { sources } => {
                self.sources.extend(sources.iter().cloned());
                None
            }
            StreamEvent::CitationDelta { source_index, .. } => {
                if !self.cited.insert(*source_index) {
                    return None;
                }
                Some(Line::Out(format!("[{source_index}]")))
            }
            StreamEvent::AnswerToken { text } => Some(Line::Out(text.clone())),
            StreamEvent::ToolResult { name, .. } => Some(Line::Err(format!("  [{name}] results received"))),
            StreamEvent::Usage { usage } => {
                self.usage = Some(*usage);
                None
            }
            StreamEvent::Followups { questions } => {
                self.followups = questions.clone();
                None
            }
            StreamEvent::Error { kind, message } => Some(Line::Err(format!("\n  [Error] {kind}: {message}"))),
            StreamEvent::Done => Some(Line::Out(self.summary())),
        }
    }

    fn summary(&self) -> String {
        let mut out = String::from("\n");
        let listed: Vec<&CitationSource> = self.sources.iter().filter(|s| self.cited.contains(&s.index)).collect();
        if !listed.is_empty() {
            out.push_str("\nSources:\n");
            for source in listed {
                match &source.url {
                    Some(url) => out.push_str(&format!("  [{}] {} <{url}>\n", source.index, source.title)),
                    None => out.push_str(&format!("  [{}] {}\n", source.index, source.title)),
                }
            }
        }
        if !self.followups.is_empty() {
            out.push_str("\nFollow-up questions:\n");
            for question in &self.followups {
                out.push_str(&format!("  - {question}\n"));
            }
        }
        if let Some(usage) = &self.usage {
            out.push_str(&format!(
                "\nTokens: {} in / {} out ({} cached)\n",
                usage.prompt_tokens, usage.completion_tokens, usage.cache_read_tokens
            ));
        }
        out
    }
}

fn status_line(step: StatusStep, message: Option<&str>, elapsed_ms: Option<u64>, passages: Option<usize>) -> String {
    match (step, message) {
        (StatusStep::RetrievingDone, _) => format!(
            "  {} passages retrieved ({} ms)",
            passages.unwrap_or(0),
            elapsed_ms.unwrap_or(0)
        ),
        (StatusStep::ToolUse | StatusStep::MemoryTool | StatusStep::MemoryDone, Some(message)) => {
            format!("  [tool] {message}")
        }
        (_, Some(message)) => format!("  {message}"),
        (_, None) => match elapsed_ms {
            Some(ms) => format!("  done ({ms} ms)"),
            None => "  done".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> AskArgs {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            ask: AskArgs,
        }
        let mut argv = vec!["ask", "compare", "ingest"];
        argv.extend_from_slice(extra);
        Wrapper::try_parse_from(argv).unwrap().ask
    }

    fn source(index: usize, title: &str, url: Option<&str>) -> CitationSource {
        CitationSource {
            index,
            passage_id: None,
            title: title.into(),
            url: url.map(str::to_string),
            source_type: "official_docs".into(),
            credibility: "high".into(),
            competitor: "kx".into(),
            primary_topic: "ingest".into(),
            content_date: String::new(),
            text_preview: String::new(),
        }
    }

    #[test]
    fn request_from_flags() {
        let request = build_request(&args(&[
            "--competitor",
            " QuestDB ",
            "--topic",
            "ingest",
            "--session",
            "abc123",
            "--no-reasoning",
        ]));
        assert_eq!(request.text, "compare ingest");
        assert_eq!(request.filters.competitors, vec!["questdb"]);
        assert_eq!(request.filters.topics, vec!["ingest"]);
        assert_eq!(request.session_id, Some(SessionId::from("abc123")));
        assert!(!request.reasoning_enabled);
        assert!(!request.fast_mode);
    }

    #[test]
    fn answer_with_citations_and_summary() {
        let mut view = AnswerView::new(false);
        assert!(
            view.render(&StreamEvent::CitationSource {
                sources: vec![source(1, "KX docs", Some("https://kx.example")), source(2, "Unused", None)],
            })
            .is_none()
        );
        assert_eq!(
            view.render(&StreamEvent::AnswerToken { text: "kdb+ is fast".into() }),
            Some(Line::Out("kdb+ is fast".into()))
        );
        let cite = StreamEvent::CitationDelta {
            source_index: 1,
            cited_text: "fast".into(),
        };
        assert_eq!(view.render(&cite), Some(Line::Out("[1]".into())));
        assert_eq!(view.render(&cite), None);
        view.render(&StreamEvent::Followups {
            questions: vec!["What about QuestDB?".into()],
        });

        let Some(Line::Out(summary)) = view.render(&StreamEvent::Done) else {
            panic!("expected summary");
        };
        assert!(summary.contains("[1] KX docs <https://kx.example>"));
        assert!(!summary.contains("Unused"));
        assert!(summary.contains("- What about QuestDB?"));
        assert!(view.failure.is_none());
    }

    #[test]
    fn error_is_recorded() {
        let mut view = AnswerView::new(false);
        let line = view.render(&StreamEvent::Error {
            kind: "generation_failure".into(),
            message: "rate limited".into(),
        });
        assert!(matches!(line, Some(Line::Err(_))));
        assert_eq!(view.failure.as_deref(), Some("generation_failure: rate limited"));
    }

    #[test]
    fn json_mode_prints_every_event() {
        let mut view = AnswerView::new(true);
        assert_eq!(
            view.render(&StreamEvent::Done),
            Some(Line::Out("{\"type\":\"done\"}\n".into()))
        );
        let status = view.render(&StreamEvent::status(StatusStep::Retrieving, "Searching"));
        assert!(matches!(status, Some(Line::Out(s)) if s.contains("\"step\":\"retrieving\"")));
    }

    #[test]
    fn status_lines() {
        assert_eq!(
            status_line(StatusStep::RetrievingDone, None, Some(42), Some(7)),
            "  7 passages retrieved (42 ms)"
        );
        assert_eq!(status_line(StatusStep::Analyzing, Some("Analyzing query..."), None, None), "  Analyzing query...");
        assert_eq!(status_line(StatusStep::AnalyzingDone, None, Some(5), None), "  done (5 ms)");
        assert_eq!(
            status_line(StatusStep::MemoryDone, Some("Memory updated"), None, None),
            "  [tool] Memory updated"
        );
    }
}
