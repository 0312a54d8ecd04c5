//! In-process adapter for tests
//! Records every command it receives and lets the test inject the events a
//! real radio would produce.

use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use log::debug;
use tokio::sync::mpsc;

use crate::core::bluetooth::commands::{Adapter, AdapterCommand, Authorization};
use crate::core::bluetooth::events::AdapterEvent;

#[derive(Clone)]
pub struct FakeAdapter {
    authorization: Authorization,
    commands: Arc<Mutex<Vec<AdapterCommand>>>,
    failing: Arc<Mutex<bool>>,
    events: mpsc::Sender<AdapterEvent>,
}

impl FakeAdapter {
    pub fn new(events: mpsc::Sender<AdapterEvent>) -> Self {
        Self {
            authorization: Authorization::Allowed,
            commands: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(false)),
            events,
        }
    }

    /// An adapter together with the receiving end of its event channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AdapterEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn with_authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = authorization;
        self
    }

    /// Makes every following command fail (after being recorded)
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut flag) = self.failing.lock() {
            *flag = failing;
        }
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<AdapterCommand> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    /// Returns and clears the recorded commands
    pub fn take_commands(&self) -> Vec<AdapterCommand> {
        self.commands
            .lock()
            .map(|mut commands| std::mem::take(&mut *commands))
            .unwrap_or_default()
    }

    /// Number of recorded commands equal to `command`
    pub fn count(&self, command: &AdapterCommand) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Delivers an event as if the radio produced it
    pub async fn emit(&self, event: AdapterEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("adapter event channel closed"))
    }
}

#[async_trait::async_trait]
impl Adapter for FakeAdapter {
    fn authorization(&self) -> Authorization {
        self.authorization
    }

    async fn send_command(&self, command: AdapterCommand) -> Result<()> {
        debug!("Fake adapter received {:?}", command);
        self.commands
            .lock()
            .map_err(|_| anyhow!("command log poisoned"))?
            .push(command.clone());
        let failing = self.failing.lock().map(|flag| *flag).unwrap_or(false);
        if failing {
            return Err(anyhow!("simulated adapter failure for {:?}", command));
        }
        Ok(())
    }
}
