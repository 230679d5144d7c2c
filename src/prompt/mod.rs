#[cfg(test)]
#[path = "prompt_test.rs"]
mod tests;

use crate::config::ContextConfig;
use crate::models::{BackendPrompt, EngineError, Message, Passage, Segment};
use crate::retrieval::ArcRetriever;
use chrono::{DateTime, Local};

const CURRENT_TIME_PLACEHOLDER: &str = "{current_time}";

/// Builds the exact input handed to a backend.
///
/// Segment order is: system instructions, reference passages (best first),
/// prior turns (oldest first), the new turn. When the prompt does not fit in
/// the budget, reference passages go first (lowest ranked first), then the
/// oldest turns. The system segment, the new turn and the most recent
/// `keep_recent_turns` turns are never dropped.
pub struct Assembler {
    retriever: ArcRetriever,
    system_prompt: String,
    keep_recent_turns: usize,
    passage_max_chars: usize,
}

/// What to assemble a prompt for.
pub struct PromptRequest<'a> {
    pub model_id: &'a str,
    /// Committed turns preceding the new one, oldest first
    pub history: &'a [Message],
    pub content: &'a str,
    /// Ceiling in characters
    pub budget: usize,
    pub retrieval: bool,
}

impl Assembler {
    pub fn new(retriever: ArcRetriever, system_prompt: &str, context: &ContextConfig) -> Self {
        Self {
            retriever,
            system_prompt: system_prompt.to_string(),
            keep_recent_turns: context.keep_recent_turns,
            passage_max_chars: context.passage_max_chars,
        }
    }

    pub async fn assemble(&self, req: PromptRequest<'_>) -> Result<BackendPrompt, EngineError> {
        let passages = if req.retrieval {
            self.retrieve(req.content).await
        } else {
            vec![]
        };
        self.build(&req, &passages, Local::now())
    }

    async fn retrieve(&self, query: &str) -> Vec<Passage> {
        match self.retriever.retrieve(query).await {
            Ok(passages) => {
                log::debug!("Retrieved {} passages", passages.len());
                passages
            }
            Err(err) => {
                log::warn!("Retrieval failed, continuing without passages: {:?}", err);
                vec![]
            }
        }
    }

    pub(crate) fn build(
        &self,
        req: &PromptRequest<'_>,
        passages: &[Passage],
        now: DateTime<Local>,
    ) -> Result<BackendPrompt, EngineError> {
        let system = Segment::system(render_system_prompt(&self.system_prompt, now));
        let mut references = passages
            .iter()
            .enumerate()
            .map(|(i, p)| Segment::reference(render_passage(i + 1, p, self.passage_max_chars)))
            .collect::<Vec<_>>();
        let mut turns = req
            .history
            .iter()
            .filter(|m| !m.is_failed())
            .map(turn_segments)
            .collect::<Vec<_>>();
        let new_turn = Segment::user(req.content);

        let fixed = system.size() + new_turn.size();
        let size = |references: &[Segment], turns: &[Vec<Segment>]| {
            fixed
                + references.iter().map(Segment::size).sum::<usize>()
                + turns.iter().flatten().map(Segment::size).sum::<usize>()
        };

        while size(&references, &turns) > req.budget && !references.is_empty() {
            references.pop();
        }

        let mut dropped = 0;
        while size(&references, &turns) > req.budget && turns.len() > self.keep_recent_turns {
            turns.remove(0);
            dropped += 1;
        }

        let total = size(&references, &turns);
        if total > req.budget {
            return Err(EngineError::ContextOverflow(format!(
                "prompt needs {} characters, model {} allows {}",
                total, req.model_id, req.budget
            )));
        }

        if dropped > 0 || references.len() < passages.len() {
            log::debug!(
                "Truncated prompt for {}: dropped {} turns and {} passages",
                req.model_id,
                dropped,
                passages.len() - references.len()
            );
        }

        let mut segments = Vec::with_capacity(2 + references.len() + turns.len() * 2);
        segments.push(system);
        segments.extend(references);
        segments.extend(turns.into_iter().flatten());
        segments.push(new_turn);

        Ok(BackendPrompt::new(req.model_id).with_segments(segments))
    }
}

fn turn_segments(message: &Message) -> Vec<Segment> {
    let mut segments = vec![Segment::user(message.content())];
    if let Some(answer) = message.answer() {
        segments.push(Segment::assistant(answer));
    }
    segments
}

pub(crate) fn render_system_prompt(template: &str, now: DateTime<Local>) -> String {
    template.replace(
        CURRENT_TIME_PLACEHOLDER,
        &now.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

pub(crate) fn render_passage(rank: usize, passage: &Passage, max_chars: usize) -> String {
    let content = passage.content.trim();
    let content = match content.char_indices().nth(max_chars) {
        Some((end, _)) => &content[..end],
        None => content,
    };
    format!(
        "[Document {}] (similarity: {:.3})\n{}",
        rank, passage.score, content
    )
}
