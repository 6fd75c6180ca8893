//! In-memory case source for tests and embedded use
//!
//! Sets are kept per app in a map behind a `RwLock`. Reads hand out clones, so
//! a batch sees a stable snapshot even if cases are added while it runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{not_found, CaseSource, EvalCase, EvalSet};
use crate::context::EvalContext;
use crate::error::{EvalError, Result};

/// In-memory eval set store
#[derive(Default)]
pub struct InMemoryCaseSource {
    sets: RwLock<HashMap<String, HashMap<String, EvalSet>>>,
}

impl InMemoryCaseSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty eval set; fails if it already exists
    pub fn create(&self, app_name: &str, eval_set_id: &str) -> Result<EvalSet> {
        let mut sets = self.write()?;
        let app = sets.entry(app_name.to_string()).or_default();
        if app.contains_key(eval_set_id) {
            return Err(EvalError::InvalidRequest(format!(
                "eval set {}.{} already exists",
                app_name, eval_set_id
            )));
        }
        let set = EvalSet::new(eval_set_id);
        app.insert(eval_set_id.to_string(), set.clone());
        Ok(set)
    }

    /// Insert or replace a whole eval set
    pub fn put(&self, app_name: &str, set: EvalSet) -> Result<()> {
        let mut sets = self.write()?;
        sets.entry(app_name.to_string())
            .or_default()
            .insert(set.eval_set_id.clone(), set);
        Ok(())
    }

    /// Append a case to an existing eval set
    pub fn add_case(&self, app_name: &str, eval_set_id: &str, eval_case: EvalCase) -> Result<()> {
        let mut sets = self.write()?;
        let set = sets
            .get_mut(app_name)
            .and_then(|app| app.get_mut(eval_set_id))
            .ok_or_else(|| not_found(app_name, eval_set_id))?;
        if set.case(&eval_case.eval_id).is_some() {
            return Err(EvalError::InvalidRequest(format!(
                "eval case {} already exists in {}.{}",
                eval_case.eval_id, app_name, eval_set_id
            )));
        }
        set.eval_cases.push(eval_case);
        Ok(())
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<String, EvalSet>>>> {
        self.sets
            .write()
            .map_err(|_| EvalError::Other("case source lock poisoned".to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, HashMap<String, EvalSet>>>> {
        self.sets
            .read()
            .map_err(|_| EvalError::Other("case source lock poisoned".to_string()))
    }
}

#[async_trait]
impl CaseSource for InMemoryCaseSource {
    async fn get(&self, _ctx: &EvalContext, app_name: &str, eval_set_id: &str) -> Result<EvalSet> {
        self.read()?
            .get(app_name)
            .and_then(|app| app.get(eval_set_id))
            .cloned()
            .ok_or_else(|| not_found(app_name, eval_set_id))
    }

    async fn list(&self, _ctx: &EvalContext, app_name: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .read()?
            .get(app_name)
            .map(|app| app.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }
}
