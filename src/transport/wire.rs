//! JSON wire format of the streaming endpoint.
//!
//! Outbound messages are built from typed structs. Inbound messages are read
//! field by field from a `serde_json::Value` so that one malformed field does
//! not cost the rest of the message.

use super::OutboundMessage;
use crate::config::SessionConfig;
use crate::{RealtalkError, Result};
use serde::Serialize;
use serde_json::{json, Value};

/// Command invocation carried by an inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub id: Option<String>,
    pub name: Option<String>,
    pub args: Value,
}

/// One decoded inbound message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    /// Base64 PCM16 audio payload
    pub audio: Option<String>,
    pub commands: Vec<CommandInvocation>,
    pub turn_complete: bool,
}

impl InboundMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.commands.is_empty() && !self.turn_complete
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseMessage<'a> {
    tool_response: ToolResponse<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse<'a> {
    function_responses: Vec<FunctionResponse<'a>>,
}

#[derive(Serialize)]
struct FunctionResponse<'a> {
    id: &'a str,
    name: &'a str,
    response: Value,
}

/// First message on a new connection
pub fn setup_message(config: &SessionConfig) -> Result<String> {
    let transport = &config.transport;

    let tools = match &config.command {
        Some(command) => vec![json!({
            "functionDeclarations": [{
                "name": command.name,
                "description": command.description,
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        command.argument.as_str(): { "type": "STRING" }
                    },
                    "required": [command.argument],
                },
            }]
        })],
        None => Vec::new(),
    };

    let message = SetupMessage {
        setup: Setup {
            model: &transport.model,
            generation_config: json!({
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": transport.voice } }
                },
            }),
            system_instruction: transport.system_instruction.as_deref().map(|text| Content {
                parts: vec![TextPart { text }],
            }),
            tools,
        },
    };

    serde_json::to_string(&message).map_err(|e| RealtalkError::ProtocolError(e.to_string()))
}

pub fn encode_outbound(message: &OutboundMessage) -> Result<String> {
    let encoded = match message {
        OutboundMessage::Audio(chunk) => serde_json::to_string(&RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: chunk.mime_type(),
                    data: chunk.data.clone(),
                }],
            },
        }),
        OutboundMessage::CommandAck { id, name, result } => serde_json::to_string(&ToolResponseMessage {
            tool_response: ToolResponse {
                function_responses: vec![FunctionResponse {
                    id,
                    name,
                    response: json!({ "result": result }),
                }],
            },
        }),
    };

    encoded.map_err(|e| RealtalkError::ProtocolError(e.to_string()))
}

/// Decode an inbound frame. Only invalid JSON is an error.
pub fn parse_inbound(text: &str) -> Result<InboundMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| RealtalkError::ProtocolError(format!("Invalid inbound JSON: {}", e)))?;

    let server_content = value.get("serverContent");

    let audio = server_content
        .and_then(|content| content.get("modelTurn"))
        .and_then(|turn| turn.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.iter().find_map(audio_part));

    let turn_complete = server_content
        .and_then(|content| content.get("turnComplete"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let commands = value
        .get("toolCall")
        .and_then(|call| call.get("functionCalls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter(|call| call.is_object())
                .map(|call| CommandInvocation {
                    id: call.get("id").and_then(Value::as_str).map(str::to_owned),
                    name: call.get("name").and_then(Value::as_str).map(str::to_owned),
                    args: call.get("args").cloned().unwrap_or(Value::Null),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(InboundMessage {
        audio,
        commands,
        turn_complete,
    })
}

fn audio_part(part: &Value) -> Option<String> {
    let inline = part.get("inlineData")?;
    if let Some(mime) = inline.get("mimeType").and_then(Value::as_str) {
        if !mime.starts_with("audio/") {
            return None;
        }
    }
    inline.get("data")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::EncodedChunk;
    use crate::config::CommandConfig;

    #[test]
    fn test_setup_message_shape() {
        let mut config = SessionConfig::default().with_command(CommandConfig::default());
        config.transport.system_instruction = Some("Be brief.".into());

        let value: Value = serde_json::from_str(&setup_message(&config).unwrap()).unwrap();
        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");

        let declaration = &setup["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "generate_system");
        assert_eq!(declaration["parameters"]["required"][0], "description");
        assert_eq!(declaration["parameters"]["properties"]["description"]["type"], "STRING");
    }

    #[test]
    fn test_setup_without_command_or_instruction() {
        let config = SessionConfig::default().without_command();
        let value: Value = serde_json::from_str(&setup_message(&config).unwrap()).unwrap();
        assert!(value["setup"].get("tools").is_none());
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_encode_audio_frame() {
        let message = OutboundMessage::Audio(EncodedChunk {
            data: "AAA=".into(),
            sample_rate: 16000,
        });
        let value: Value = serde_json::from_str(&encode_outbound(&message).unwrap()).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAA=");
    }

    #[test]
    fn test_encode_command_ack() {
        let message = OutboundMessage::CommandAck {
            id: "call-7".into(),
            name: "generate_system".into(),
            result: "ok".into(),
        };
        let value: Value = serde_json::from_str(&encode_outbound(&message).unwrap()).unwrap();
        let response = &value["toolResponse"]["functionResponses"][0];
        assert_eq!(response["id"], "call-7");
        assert_eq!(response["name"], "generate_system");
        assert_eq!(response["response"]["result"], "ok");
    }

    #[test]
    fn test_parse_audio_and_turn_complete() {
        let message = parse_inbound(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"text":"hi"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}}
            ]},"turnComplete":true}}"#,
        )
        .unwrap();
        assert_eq!(message.audio.as_deref(), Some("AAAA"));
        assert!(message.turn_complete);
        assert!(message.commands.is_empty());
    }

    #[test]
    fn test_parse_skips_non_audio_inline_data() {
        let message = parse_inbound(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"image/png","data":"xx"}}
            ]}}}"#,
        )
        .unwrap();
        assert!(message.audio.is_none());
    }

    #[test]
    fn test_parse_tool_call() {
        let message = parse_inbound(
            r#"{"toolCall":{"functionCalls":[
                {"id":"a1","name":"generate_system","args":{"description":"a red giant"}},
                {"name":"no_id"},
                "garbage"
            ]}}"#,
        )
        .unwrap();
        assert_eq!(message.commands.len(), 2);
        assert_eq!(message.commands[0].id.as_deref(), Some("a1"));
        assert_eq!(message.commands[0].args["description"], "a red giant");
        assert!(message.commands[1].id.is_none());
        assert_eq!(message.commands[1].args, Value::Null);
    }

    #[test]
    fn test_malformed_field_keeps_others() {
        let message = parse_inbound(
            r#"{"serverContent":{"modelTurn":{"parts":"oops"},"turnComplete":true},
                "toolCall":{"functionCalls":[{"id":"b","name":"x","args":{}}]}}"#,
        )
        .unwrap();
        assert!(message.audio.is_none());
        assert!(message.turn_complete);
        assert_eq!(message.commands.len(), 1);
    }

    #[test]
    fn test_setup_complete_is_empty() {
        assert!(parse_inbound(r#"{"setupComplete":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_protocol_error() {
        assert!(matches!(
            parse_inbound("{not json"),
            Err(RealtalkError::ProtocolError(_))
        ));
    }
}
