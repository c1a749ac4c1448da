// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! Speech-to-text stage.
//!
//! Feeds inbound PCM to the provider and turns its events into user
//! [`TranscriptFrame`]s, partials first, one final per utterance. A provider
//! failure drops that utterance's transcript and nothing else — the session
//! keeps running and the next utterance is processed normally.

use async_trait::async_trait;

use crate::frames::{Frame, Role, TranscriptFrame};
use crate::pipeline::{FrameDirection, Stage, StageContext, StageWeight};
use crate::providers::SpeechToText;

pub struct SttStage {
    provider: Box<dyn SpeechToText>,
    /// Highest utterance id already finalized; late partials below it are
    /// superseded and dropped.
    finalized: u64,
}

impl SttStage {
    pub fn new(provider: Box<dyn SpeechToText>) -> Self {
        Self {
            provider,
            finalized: 0,
        }
    }
}

#[async_trait]
impl Stage for SttStage {
    fn name(&self) -> &str {
        "stt"
    }

    fn weight(&self) -> StageWeight {
        StageWeight::Heavy
    }

    async fn process(&mut self, frame: Frame, direction: FrameDirection, ctx: &StageContext) {
        if direction == FrameDirection::Upstream {
            ctx.send_upstream(frame);
            return;
        }
        match frame {
            Frame::Audio(audio) => {
                match self.provider.transcribe(&audio.pcm, audio.sample_rate).await {
                    Ok(events) => {
                        for event in events {
                            if event.utterance <= self.finalized {
                                tracing::debug!(
                                    utterance = event.utterance,
                                    "transcript event superseded, dropped"
                                );
                                continue;
                            }
                            if event.is_final {
                                self.finalized = event.utterance;
                            }
                            ctx.send_downstream(Frame::Transcript(TranscriptFrame::new(
                                event.text,
                                Role::User,
                                event.is_final,
                                event.utterance,
                            )));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "transcription failed, utterance dropped");
                    }
                }
                // Raw audio has no consumer past this stage.
            }
            other => ctx.send_downstream(other),
        }
    }
}
