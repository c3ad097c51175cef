use crate::callsites;
use crate::model::{LlmSpan, RagResult, RagSpan, Span, MISSING_RAG_SCORE};
use crate::record::LogRecord;
use serde_json::Value;

/// Extracts the span a single log line describes, if any.
pub fn span_from_record(record: &LogRecord) -> Option<Span> {
    let function = record.function()?;

    if let Some(provider) = callsites::llm_provider(function) {
        return llm_span(provider, record);
    }
    if callsites::is_rag_lookup(function) {
        return rag_span(record);
    }
    None
}

fn llm_span(provider: &str, record: &LogRecord) -> Option<Span> {
    let request_json = record.request().map(Value::to_string).unwrap_or_default();
    let response_json = record.response().map(Value::to_string).unwrap_or_default();
    if request_json.is_empty() && response_json.is_empty() {
        return None;
    }
    Some(Span::Llm(LlmSpan {
        provider: provider.to_string(),
        request_json,
        response_json,
    }))
}

fn rag_span(record: &LogRecord) -> Option<Span> {
    let query = record.get_str("query").unwrap_or_default().to_string();
    let mut results = Vec::new();
    if let Some(example) = record.get("example").filter(|value| value.is_object()) {
        results.push(RagResult {
            example: example.clone(),
            score: record.get_f64("score").unwrap_or(MISSING_RAG_SCORE),
        });
    }
    if query.is_empty() && results.is_empty() {
        return None;
    }
    Some(Span::Rag(RagSpan { query, results }))
}

/// Collapses same-kind spans. The merged retrieval span precedes the merged
/// model span.
pub fn merge_spans(spans: Vec<Span>) -> Vec<Span> {
    let mut rag: Option<RagSpan> = None;
    let mut llm: Option<LlmSpan> = None;

    for span in spans {
        match span {
            Span::Rag(next) => {
                rag = Some(match rag {
                    Some(current) => merge_rag(current, next),
                    None => next,
                });
            }
            Span::Llm(next) => {
                llm = Some(match llm {
                    Some(current) => merge_llm(current, next),
                    None => next,
                });
            }
        }
    }

    rag.map(Span::Rag)
        .into_iter()
        .chain(llm.map(Span::Llm))
        .collect()
}

fn merge_rag(mut current: RagSpan, next: RagSpan) -> RagSpan {
    if current.query.is_empty() {
        current.query = next.query;
    }
    current.results.extend(next.results);
    current
}

fn merge_llm(mut current: LlmSpan, next: LlmSpan) -> LlmSpan {
    if current.provider.is_empty() {
        current.provider = next.provider;
    }
    if current.request_json.is_empty() {
        current.request_json = next.request_json;
    }
    if current.response_json.is_empty() {
        current.response_json = next.response_json;
    }
    current
}
