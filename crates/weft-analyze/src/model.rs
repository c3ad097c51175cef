use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weft_store::Record;

/// Exit code stored on a block log until an execution reports one.
pub const UNSET_EXIT_CODE: i32 = -2377;

/// Score recorded for a retrieval result that was logged without one.
pub const MISSING_RAG_SCORE: f64 = -277.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    #[serde(rename = "MARKUP")]
    Markup,
    #[serde(rename = "CODE")]
    Code,
    #[default]
    #[serde(rename = "UNKNOWN", other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockOutputItem {
    pub mime: String,
    #[serde(alias = "text_data")]
    pub text_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockOutput {
    pub items: Vec<BlockOutputItem>,
}

impl BlockOutput {
    /// Parses an item of the form `exitCode: N`.
    pub fn exit_code(&self) -> Option<i32> {
        self.items.iter().find_map(|item| {
            let rest = item.text_data.strip_prefix("exitCode:")?;
            rest.trim().parse::<i32>().ok()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    pub language: String,
    pub contents: String,
    pub outputs: Vec<BlockOutput>,
    #[serde(alias = "trace_ids")]
    pub trace_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Doc {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateRequest {
    pub doc: Doc,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateResponse {
    pub blocks: Vec<Block>,
    #[serde(alias = "trace_id")]
    pub trace_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteRequest {
    pub block: Block,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteResponse {
    pub outputs: Vec<BlockOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateTrace {
    pub request: Option<GenerateRequest>,
    pub response: Option<GenerateResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecuteTrace {
    pub request: Option<ExecuteRequest>,
    pub response: Option<ExecuteResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TraceData {
    Generate(GenerateTrace),
    Execute(ExecuteTrace),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSpan {
    pub provider: String,
    pub request_json: String,
    pub response_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RagResult {
    pub example: Value,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RagSpan {
    pub query: String,
    pub results: Vec<RagResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Span {
    Llm(LlmSpan),
    Rag(RagSpan),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Trace {
    pub id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub eval_mode: bool,
    pub data: Option<TraceData>,
    pub spans: Vec<Span>,
    pub assertions: Vec<Value>,
    pub version: String,
}

impl Trace {
    pub fn generate(&self) -> Option<&GenerateTrace> {
        match &self.data {
            Some(TraceData::Generate(generate)) => Some(generate),
            _ => None,
        }
    }

    pub fn execute(&self) -> Option<&ExecuteTrace> {
        match &self.data {
            Some(TraceData::Execute(execute)) => Some(execute),
            _ => None,
        }
    }
}

/// Raw lines accumulated for one trace id, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEntries {
    pub lines: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionStatus {
    Accepted,
    Rejected,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockLog {
    pub id: String,
    pub gen_trace_id: String,
    pub exec_trace_ids: Vec<String>,
    pub doc: Option<Doc>,
    pub generated_block: Option<Block>,
    pub executed_block: Option<Block>,
    pub exit_code: i32,
    pub eval_mode: bool,
    pub suggestion_status: SuggestionStatus,
    pub version: String,
}

impl Default for BlockLog {
    fn default() -> Self {
        Self {
            id: String::new(),
            gen_trace_id: String::new(),
            exec_trace_ids: Vec::new(),
            doc: None,
            generated_block: None,
            executed_block: None,
            exit_code: UNSET_EXIT_CODE,
            eval_mode: false,
            suggestion_status: SuggestionStatus::Unknown,
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEventType {
    Execute,
    Accepted,
    Rejected,
    SessionStart,
    SessionEnd,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    #[serde(rename = "CELL_KIND_MARKUP")]
    Markup,
    #[serde(rename = "CELL_KIND_CODE")]
    Code,
    #[default]
    #[serde(rename = "CELL_KIND_UNSPECIFIED", other)]
    Unspecified,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CellOutputItem {
    pub mime: String,
    #[serde(alias = "textData")]
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CellOutput {
    pub items: Vec<CellOutputItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cell {
    pub kind: CellKind,
    pub value: String,
    pub language_id: String,
    pub metadata: Map<String, Value>,
    pub outputs: Vec<CellOutput>,
}

impl Cell {
    /// Cells carry their id under either `runme.dev/id` or `id`.
    pub fn id(&self) -> Option<&str> {
        ["runme.dev/id", "id"]
            .iter()
            .find_map(|field| self.metadata.get(*field).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
    }

    pub fn to_block(&self) -> Block {
        let kind = match self.kind {
            CellKind::Code => BlockKind::Code,
            CellKind::Markup => BlockKind::Markup,
            CellKind::Unspecified => BlockKind::Unknown,
        };
        Block {
            id: self.id().unwrap_or_default().to_string(),
            kind,
            language: self.language_id.clone(),
            contents: self.value.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|output| BlockOutput {
                    items: output
                        .items
                        .iter()
                        .map(|item| BlockOutputItem {
                            mime: item.mime.clone(),
                            text_data: item.data.clone(),
                        })
                        .collect(),
                })
                .collect(),
            trace_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogEvent {
    pub event_id: String,
    pub context_id: String,
    #[serde(rename = "type")]
    pub event_type: LogEventType,
    pub selected_id: String,
    pub selected_index: i32,
    pub cells: Vec<Cell>,
}

impl LogEvent {
    /// The cell an EXECUTE event refers to: by id, then by index, then the
    /// last cell.
    pub fn selected_cell(&self) -> Option<&Cell> {
        if !self.selected_id.is_empty() {
            if let Some(cell) = self
                .cells
                .iter()
                .find(|cell| cell.id() == Some(self.selected_id.as_str()))
            {
                return Some(cell);
            }
        }
        usize::try_from(self.selected_index)
            .ok()
            .and_then(|index| self.cells.get(index))
            .or_else(|| self.cells.last())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Session {
    pub context_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub log_events: Vec<LogEvent>,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    #[serde(alias = "gen_trace_ids")]
    pub gen_trace_ids: Vec<String>,
    pub full_context: Option<Value>,
    pub version: String,
}

/// Process-wide position of the log reader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub file: String,
    pub offset: i64,
}

impl Record for LogEntries {
    fn version(&self) -> &str {
        &self.version
    }

    fn set_version(&mut self, version: String) {
        self.version = version;
    }
}

impl Record for Trace {
    fn version(&self) -> &str {
        &self.version
    }

    fn set_version(&mut self, version: String) {
        self.version = version;
    }
}

impl Record for BlockLog {
    fn version(&self) -> &str {
        &self.version
    }

    fn set_version(&mut self, version: String) {
        self.version = version;
    }
}

impl Record for Session {
    fn version(&self) -> &str {
        &self.version
    }

    fn set_version(&mut self, version: String) {
        self.version = version;
    }
}
