use crate::infrastructure::error::CoreError;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRules {
    pub domains: Vec<String>,
    pub redirect_target: String,
}

// The host extension owns URL interception; the core only hands it the
// domain list and redirect target, and clears the rules on termination.
pub trait BlockingEnforcer: Send + Sync {
    fn install(&self, domains: &[String], redirect_target: &str) -> Result<(), CoreError>;
    fn clear(&self) -> Result<(), CoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlockingEnforcer {
    rules: Mutex<Option<InstalledRules>>,
}

impl InMemoryBlockingEnforcer {
    pub fn installed(&self) -> Option<InstalledRules> {
        match self.rules.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl BlockingEnforcer for InMemoryBlockingEnforcer {
    fn install(&self, domains: &[String], redirect_target: &str) -> Result<(), CoreError> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|error| CoreError::Validation(format!("blocking rules lock poisoned: {error}")))?;
        *rules = Some(InstalledRules {
            domains: domains.to_vec(),
            redirect_target: redirect_target.to_string(),
        });
        Ok(())
    }

    fn clear(&self) -> Result<(), CoreError> {
        let mut rules = self
            .rules
            .lock()
            .map_err(|error| CoreError::Validation(format!("blocking rules lock poisoned: {error}")))?;
        *rules = None;
        Ok(())
    }
}
