//! Calling sites that identify what a log line is about.
//!
//! Loggers record fully qualified functions such as
//! `github.com/org/app/pkg/agent.(*Agent).Generate`; matching ignores the
//! package path and compares the final segment.

pub const GENERATE: &str = "agent.(*Agent).Generate";
pub const STREAM_GENERATE: &str = "agent.(*Agent).StreamGenerate";
pub const EXECUTE: &str = "executor.(*Executor).Execute";
pub const LOG_EVENTS: &str = "agent.(*Agent).LogEvents";
pub const LLM_USAGE: &str = "llms.LogLLMUsage";
pub const RAG_LOOKUP: &str = "learn.(*InMemoryExampleDB).GetExamples";
pub const ANTHROPIC_COMPLETE: &str = "anthropic.(*Completer).Complete";
pub const OPENAI_COMPLETE: &str = "oai.(*Completer).Complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Generate,
    Execute,
    StreamGenerate,
}

impl TraceKind {
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::Generate => GENERATE,
            Self::Execute => EXECUTE,
            Self::StreamGenerate => STREAM_GENERATE,
        }
    }
}

fn local_name(function: &str) -> &str {
    function.rsplit('/').next().unwrap_or(function)
}

pub fn is_site(function: &str, site: &str) -> bool {
    local_name(function) == site
}

/// Log statements inside closures carry suffixes like `.func1`.
pub fn is_within_site(function: &str, site: &str) -> bool {
    local_name(function).starts_with(site)
}

pub fn classify(function: &str) -> Option<TraceKind> {
    [TraceKind::Generate, TraceKind::Execute, TraceKind::StreamGenerate]
        .into_iter()
        .find(|kind| is_site(function, kind.entry_point()))
}

pub fn is_log_events(function: &str) -> bool {
    is_within_site(function, LOG_EVENTS)
}

pub fn is_llm_usage(function: &str) -> bool {
    is_site(function, LLM_USAGE)
}

pub fn is_rag_lookup(function: &str) -> bool {
    is_within_site(function, RAG_LOOKUP)
}

pub fn llm_provider(function: &str) -> Option<&'static str> {
    if is_site(function, ANTHROPIC_COMPLETE) {
        Some("anthropic")
    } else if is_site(function, OPENAI_COMPLETE) {
        Some("openai")
    } else {
        None
    }
}
