//! Typed SSE payloads.
//!
//! Every enum carries an `Unknown` fallback so new event kinds decode
//! cleanly and are ignored by the parsers.

pub mod openai {
    use serde::Deserialize;

    /// Top-level OpenAI Responses SSE event, tagged by `type` field.
    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum Event {
        #[serde(rename = "response.output_item.added")]
        OutputItemAdded {
            item_id: Option<String>,
            #[serde(alias = "output_item")]
            item: Option<OutputItem>,
        },
        #[serde(rename = "response.output_item.done")]
        OutputItemDone {
            item_id: Option<String>,
            #[serde(alias = "output_item")]
            item: Option<OutputItem>,
        },
        #[serde(rename = "response.output_text.delta")]
        OutputTextDelta {
            item_id: Option<String>,
            delta: Option<String>,
        },
        #[serde(rename = "response.output_text.done")]
        OutputTextDone {
            item_id: Option<String>,
            text: Option<String>,
        },
        #[serde(rename = "response.function_call_arguments.delta")]
        FunctionCallArgumentsDelta {
            item_id: Option<String>,
            call_id: Option<String>,
            delta: Option<String>,
        },
        #[serde(rename = "response.function_call_arguments.done")]
        FunctionCallArgumentsDone {
            item_id: Option<String>,
            call_id: Option<String>,
            arguments: Option<String>,
        },
        #[serde(rename = "response.completed")]
        Completed { response: Option<ResponseInfo> },
        #[serde(rename = "response.incomplete")]
        Incomplete { response: Option<ResponseInfo> },
        #[serde(rename = "response.failed")]
        Failed {
            response: Option<ResponseInfo>,
            error: Option<ErrorInfo>,
        },
        #[serde(rename = "error")]
        Error {
            error: Option<ErrorInfo>,
            message: Option<String>,
            code: Option<String>,
        },
        /// Unknown event type - forward compatibility
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    #[serde(tag = "type")]
    pub enum OutputItem {
        #[serde(rename = "function_call")]
        FunctionCall {
            id: Option<String>,
            call_id: Option<String>,
            name: Option<String>,
            arguments: Option<String>,
        },
        #[serde(other)]
        Unknown,
    }

    #[derive(Debug, Deserialize)]
    pub struct ResponseInfo {
        pub usage: Option<Usage>,
        pub error: Option<ErrorInfo>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Usage {
        #[serde(default)]
        pub input_tokens: u64,
        #[serde(default)]
        pub output_tokens: u64,
        pub total_tokens: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorInfo {
        pub code: Option<String>,
        pub message: Option<String>,
    }

    /// `GET /models` response body.
    #[derive(Debug, Deserialize)]
    pub struct ModelList {
        #[serde(default)]
        pub data: Vec<ModelEntry>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ModelEntry {
        pub id: String,
    }
}
