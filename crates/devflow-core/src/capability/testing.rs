//! Scripted capabilities for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::{
    ActionOutcome, CapabilityError, ExternalAction, GenerationOutcome, GenerationRequest,
    Generator,
};

type ActionReply = Result<ActionOutcome, CapabilityError>;

/// Shared record of the calls a scripted capability received.
#[derive(Debug, Clone)]
pub(crate) struct CallLog<T>(Arc<Mutex<Vec<T>>>);

impl<T> Default for CallLog<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> CallLog<T> {
    fn push(&self, item: T) {
        self.0.lock().unwrap().push(item);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub(crate) fn all(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}

/// An action whose replies are queued per action name. The last queued
/// reply repeats; unscripted actions echo their inputs back.
pub(crate) struct ScriptedAction {
    replies: Mutex<HashMap<String, VecDeque<ActionReply>>>,
    delay: Option<Duration>,
    log: CallLog<(String, Map<String, Value>)>,
}

impl ScriptedAction {
    pub(crate) fn ok() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            delay: None,
            log: CallLog::default(),
        }
    }

    pub(crate) fn on(self, action: &str, reply: ActionReply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub(crate) fn returning(self, action: &str, outputs: Value) -> Self {
        self.on(action, Ok(ActionOutcome::new(outputs)))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn log(&self) -> CallLog<(String, Map<String, Value>)> {
        self.log.clone()
    }

    fn next_reply(&self, action: &str, inputs: &Map<String, Value>) -> ActionReply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(action) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => Ok(ActionOutcome::new(
                json!({ "action": action, "inputs": inputs }),
            )),
        }
    }
}

impl ExternalAction for ScriptedAction {
    async fn invoke(
        &self,
        action: &str,
        inputs: &Map<String, Value>,
    ) -> Result<ActionOutcome, CapabilityError> {
        self.log.push((action.to_string(), inputs.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_reply(action, inputs)
    }
}

/// A generator replaying queued outcomes; the last one repeats.
pub(crate) struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<GenerationOutcome, CapabilityError>>>,
    log: CallLog<GenerationRequest>,
}

impl ScriptedGenerator {
    pub(crate) fn returning(content: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            log: CallLog::default(),
        }
        .then(Ok(GenerationOutcome {
            content: content.to_string(),
            tokens_in: 100,
            tokens_out: 200,
            ..GenerationOutcome::default()
        }))
    }

    pub(crate) fn then(self, reply: Result<GenerationOutcome, CapabilityError>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn then_content(self, content: &str, cost: f64) -> Self {
        self.then(Ok(GenerationOutcome {
            content: content.to_string(),
            cost: Some(cost),
            ..GenerationOutcome::default()
        }))
    }

    pub(crate) fn log(&self) -> CallLog<GenerationRequest> {
        self.log.clone()
    }
}

impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, CapabilityError> {
        self.log.push(request.clone());
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies
                .front()
                .cloned()
                .unwrap_or_else(|| Err(CapabilityError::permanent("no scripted reply")))
        }
    }
}
