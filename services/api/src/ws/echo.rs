//! A behavior handler that repeats what the caller says.

use async_trait::async_trait;
use chrono::Utc;
use relay_core::{
    Session, SessionHandler,
    protocol::{DtmfMessage, ErrorMessage, InterruptMessage, PromptMessage, SetupMessage},
};
use tracing::{info, warn};

/// Speaks each final prompt back to the caller and replays pressed keys as digits.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn on_setup(&self, _session: &Session, message: &SetupMessage) -> anyhow::Result<()> {
        info!(
            direction = ?message.direction,
            custom_parameters = ?message.custom_parameters,
            "Call connected."
        );
        Ok(())
    }

    async fn on_prompt(&self, session: &Session, message: &PromptMessage) -> anyhow::Result<()> {
        if message.last {
            session
                .send_last_token(message.voice_prompt.clone())
                .await?;
        }
        Ok(())
    }

    async fn on_interrupt(
        &self,
        _session: &Session,
        message: &InterruptMessage,
    ) -> anyhow::Result<()> {
        info!(
            utterance = %message.utterance_until_interrupt,
            duration_ms = message.duration_until_interrupt_ms,
            "Caller interrupted."
        );
        Ok(())
    }

    async fn on_dtmf(&self, session: &Session, message: &DtmfMessage) -> anyhow::Result<()> {
        session.send_digits(message.digit.clone()).await?;
        Ok(())
    }

    async fn on_error(&self, _session: &Session, message: &ErrorMessage) -> anyhow::Result<()> {
        warn!(description = %message.description, "Relay error.");
        Ok(())
    }

    async fn on_close(&self, session: &Session) -> anyhow::Result<()> {
        let duration = Utc::now() - session.start_time();
        info!(duration_secs = duration.num_seconds(), "Call ended.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use relay_core::{Engine, Transport};
    use serde_json::{Value, json};
    use std::{
        io,
        sync::{Arc, Mutex},
    };
    use tracing::Level;
    use tracing_subscriber::fmt::MakeWriter;

    const SETUP: &str = r#"{"type":"setup","sessionId":"VX1","callSid":"CA1","accountSid":"AC1","from":"+15550001","to":"+15550002","direction":"inbound"}"#;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Value>>);

    #[async_trait]
    impl Transport for Recorder {
        fn is_open(&self) -> bool {
            true
        }

        async fn send_text(&self, frame: String) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(serde_json::from_str(&frame)?);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Logs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    async fn run(frames: &[&str]) -> Vec<Value> {
        let transport = Arc::new(Recorder::default());
        let engine = Engine::new(transport.clone(), Arc::new(EchoHandler));
        let frames: Vec<String> = frames.iter().map(|f| f.to_string()).collect();
        engine.start(stream::iter(frames), None).await;
        engine.close().await;
        transport.0.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn answers_only_the_final_prompt_chunk() {
        let sent = run(&[
            SETUP,
            r#"{"type":"prompt","voicePrompt":"hel","lang":"en-US","last":false}"#,
            r#"{"type":"prompt","voicePrompt":"hello","lang":"en-US","last":true}"#,
        ])
        .await;
        assert_eq!(sent, vec![json!({"type": "text", "token": "hello", "last": true})]);
    }

    #[tokio::test]
    async fn replays_pressed_keys_as_digits() {
        let sent = run(&[SETUP, r#"{"type":"dtmf","digit":"4"}"#]).await;
        assert_eq!(sent, vec![json!({"type": "sendDigits", "digits": "4"})]);
    }

    #[tokio::test]
    async fn relay_errors_are_logged_once() {
        let logs = Logs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let sent = run(&[SETUP, r#"{"type":"error","description":"tts failed"}"#]).await;

        assert!(sent.is_empty());
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1, "{lines:?}");
        assert!(lines[0].contains("tts failed"));
    }
}
