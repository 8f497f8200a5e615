use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audio::codec::Blob;
use crate::config::Config;
use crate::tools;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<Tool>,
    pub input_audio_transcription: Value,
    pub output_audio_transcription: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

impl ClientMessage {
    /// The one-time session setup sent right after the socket opens.
    #[must_use]
    pub fn setup(config: &Config) -> Self {
        Self::Setup(Setup {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: json!({
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": config.voice } }
                }),
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            },
            tools: vec![Tool {
                function_declarations: tools::manifest(),
            }],
            input_audio_transcription: json!({}),
            output_audio_transcription: json!({}),
        })
    }

    #[must_use]
    pub const fn audio(blob: Blob) -> Self {
        Self::RealtimeInput(RealtimeInput { audio: blob })
    }

    #[must_use]
    pub fn tool_response(response: FunctionResponse) -> Self {
        Self::ToolResponse(ToolResponse {
            function_responses: vec![response],
        })
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::RealtimeInput(_) => "realtimeInput",
            Self::ToolResponse(_) => "toolResponse",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
    #[serde(default)]
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Audio blobs carried in the model turn, in part order.
    pub fn audio_parts(&self) -> impl Iterator<Item = &Blob> {
        self.server_content
            .iter()
            .filter_map(|c| c.model_turn.as_ref())
            .flat_map(|t| t.parts.iter())
            .filter_map(|p| p.inline_data.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_message_shape() {
        let config = Config {
            voice: "Kore".to_string(),
            system_instruction: "be nice".to_string(),
            ..Config::default()
        };
        let value = serde_json::to_value(ClientMessage::setup(&config))
            .unwrap_or_else(|e| panic!("{e}"));

        let setup = &value["setup"];
        assert_eq!(setup["model"], config.model.as_str());
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "be nice");
        assert!(setup["inputAudioTranscription"].is_object());
        assert!(setup["outputAudioTranscription"].is_object());

        let decl = &setup["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], tools::SHOW_DIRECTION);
        assert_eq!(decl["parameters"]["required"][0], "direction");
        assert_eq!(
            decl["parameters"]["properties"]["direction"]["enum"],
            json!(["left", "right"])
        );
    }

    #[test]
    fn realtime_input_and_tool_response_shape() {
        let audio = ClientMessage::audio(Blob {
            data: "AAA=".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        });
        let value = serde_json::to_value(&audio).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");

        let resp = ClientMessage::tool_response(FunctionResponse {
            id: "call-1".to_string(),
            name: "show_direction".to_string(),
            response: json!({"result": "ok"}),
        });
        let value = serde_json::to_value(&resp).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(value["toolResponse"]["functionResponses"][0]["id"], "call-1");
        assert_eq!(resp.kind(), "toolResponse");
    }

    #[test]
    fn parse_server_content() {
        let raw = br#"{
            "serverContent": {
                "modelTurn": { "parts": [ { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } } ] },
                "inputTranscription": { "text": "hel" },
                "outputTranscription": { "text": "hi " },
                "turnComplete": true
            }
        }"#;
        let msg = ServerMessage::parse(raw).unwrap_or_else(|e| panic!("{e}"));
        let content = msg.server_content.as_ref().unwrap_or_else(|| panic!("no content"));
        assert!(content.turn_complete);
        assert!(!content.interrupted);
        assert_eq!(
            content.input_transcription.as_ref().map(|t| t.text.as_str()),
            Some("hel")
        );
        assert_eq!(msg.audio_parts().count(), 1);
    }

    #[test]
    fn parse_tool_call_and_control_messages() {
        let raw = br#"{"toolCall":{"functionCalls":[{"id":"a1","name":"show_direction","args":{"direction":"left"}}]}}"#;
        let msg = ServerMessage::parse(raw).unwrap_or_else(|e| panic!("{e}"));
        let calls = msg.tool_call.unwrap_or_else(|| panic!("no tool call")).function_calls;
        assert_eq!(calls[0].id, "a1");
        assert_eq!(calls[0].args["direction"], "left");

        let setup = ServerMessage::parse(br#"{"setupComplete":{}}"#).unwrap_or_else(|e| panic!("{e}"));
        assert!(setup.is_setup_complete());

        let away = ServerMessage::parse(br#"{"goAway":{"timeLeft":"10s"}}"#)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(away.go_away.and_then(|g| g.time_left).as_deref(), Some("10s"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = ServerMessage::parse(br#"{"usageMetadata":{"totalTokenCount":3}}"#)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(msg, ServerMessage::default());
    }
}
