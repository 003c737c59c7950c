//! Queue - 同時実行数による入場制御
//!
//! Every queue (the unnamed default one included) owns two versioned
//! counters: `max:<queue>` and `running:<queue>`. `poke` promotes ENQUEUED
//! tasks while `running < max`; tasks leaving the RUNNING group give their
//! slot back through `decrease_running_counter`.

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::ports::Versioned;
use crate::store::Transaction;

fn max_key(queue: Option<&str>) -> String {
    format!("max:{}", queue.unwrap_or_default())
}

fn running_key(queue: Option<&str>) -> String {
    format!("running:{}", queue.unwrap_or_default())
}

pub struct QueueController<'e> {
    engine: &'e Engine,
}

impl<'e> QueueController<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    /// Dequeue as many ENQUEUED tasks as there are free slots; returns how
    /// many were promoted.
    ///
    /// # Design note
    /// Both counters are read up front and `running` is written once at the
    /// end with the version read here, so a concurrent poke of the same
    /// queue makes one of the two transactions fail at commit.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub async fn poke(&self, tx: &mut Transaction, queue: Option<&str>) -> Result<usize> {
        let max = self.max(tx, queue)?;
        let running_key = running_key(queue);
        let running = self.counter_or_init(tx, &running_key, 0)?;

        if running.value >= max.value {
            tracing::debug!(queue, running = running.value, max = max.value, "queue is full");
            return Ok(0);
        }
        let free = usize::try_from(max.value - running.value).unwrap_or(0);

        let mut candidates = tx.enqueued_in(queue)?;
        // oldest ENQUEUED first
        candidates.sort_by(|a, b| {
            let since = |t: &Versioned<crate::domain::Task>| t.value.timestamps.last().map(|s| s.at);
            since(a)
                .cmp(&since(b))
                .then_with(|| a.value.name.cmp(&b.value.name))
        });

        let controller = self.engine.controller();
        let mut promoted = 0usize;
        for candidate in candidates.into_iter().take(free) {
            controller.dequeue(tx, &candidate.value.name).await?;
            promoted += 1;
        }

        if promoted > 0 {
            let next = running.value + promoted as i64;
            if !tx.cas_replace_counter(&running_key, next, running.version)? {
                return Err(EngineError::concurrent(running_key));
            }
            tracing::info!(queue, promoted, running = next, max = max.value, "queue poked");
        }
        Ok(promoted)
    }

    /// Give back one slot. Never goes below zero.
    pub async fn decrease_running_counter(&self, tx: &mut Transaction, queue: Option<&str>) -> Result<()> {
        let key = running_key(queue);
        let running = self.counter_or_init(tx, &key, 0)?;
        if running.value <= 0 {
            tracing::warn!(queue, "running counter already at zero");
            return Ok(());
        }
        if !tx.cas_replace_counter(&key, running.value - 1, running.version)? {
            return Err(EngineError::concurrent(key));
        }
        Ok(())
    }

    /// Initialize or replace `max`, then poke right away.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub async fn set_maximum_concurrency(&self, tx: &mut Transaction, queue: Option<&str>, max: i64) -> Result<usize> {
        if max < 0 {
            return Err(EngineError::Validation(format!(
                "max concurrency must be >= 0, got {max}"
            )));
        }
        let key = max_key(queue);
        match tx.get_counter(&key)? {
            Some(current) => {
                if !tx.cas_replace_counter(&key, max, current.version)? {
                    return Err(EngineError::concurrent(key));
                }
            }
            None => {
                if tx.cas_create_counter(&key, max)?.is_some() {
                    return Err(EngineError::concurrent(key));
                }
            }
        }
        tracing::info!(queue, max, "max concurrency set");
        self.poke(tx, queue).await
    }

    /// `(max, running)` of a queue.
    pub fn counters(&self, tx: &mut Transaction, queue: Option<&str>) -> Result<(i64, i64)> {
        let max = tx
            .get_counter(&max_key(queue))?
            .map_or(self.engine.config().default_max_concurrency, |v| v.value);
        let running = tx.get_counter(&running_key(queue))?.map_or(0, |v| v.value);
        Ok((max, running))
    }

    fn max(&self, tx: &mut Transaction, queue: Option<&str>) -> Result<Versioned<i64>> {
        let default = self.engine.config().default_max_concurrency;
        self.counter_or_init(tx, &max_key(queue), default)
    }

    fn counter_or_init(&self, tx: &mut Transaction, key: &str, initial: i64) -> Result<Versioned<i64>> {
        if let Some(counter) = tx.get_counter(key)? {
            return Ok(counter);
        }
        tx.cas_create_counter(key, initial)?;
        tx.get_counter(key)?
            .ok_or_else(|| EngineError::Internal(format!("counter {key} vanished after create")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, "max:", "running:")]
    #[case(Some("gpu"), "max:gpu", "running:gpu")]
    fn counter_keys_are_per_queue(#[case] queue: Option<&str>, #[case] max: &str, #[case] running: &str) {
        assert_eq!(max_key(queue), max);
        assert_eq!(running_key(queue), running);
    }
}
