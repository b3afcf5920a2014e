//! In-process remote store for tests

use super::error::SyncError;
use super::models::{MonthData, YearPlan};
use super::remote::RemoteStore;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

/// Remote store with scripted failures, call counters and optional latency
#[derive(Default)]
pub(crate) struct ScriptedRemote {
    plans: StdMutex<HashMap<i32, YearPlan>>,
    failures: StdMutex<VecDeque<SyncError>>,
    latency: StdMutex<Option<Duration>>,
    in_flight: StdMutex<HashMap<i32, usize>>,
    max_in_flight_year: AtomicUsize,
    max_in_flight_total: AtomicUsize,
    save_calls: AtomicU32,
    patch_calls: AtomicU32,
    get_calls: AtomicU32,
    delete_calls: AtomicU32,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` calls fail with `err`
    pub fn fail_next(&self, err: SyncError, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        failures.extend(std::iter::repeat(err).take(times));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn insert(&self, plan: YearPlan) {
        self.plans.lock().unwrap().insert(plan.year, plan);
    }

    pub fn stored(&self, year: i32) -> Option<YearPlan> {
        self.plans.lock().unwrap().get(&year).cloned()
    }

    pub fn save_calls(&self) -> u32 {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn patch_calls(&self) -> u32 {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Most concurrent writes ever seen for a single year
    pub fn max_in_flight_per_year(&self) -> usize {
        self.max_in_flight_year.load(Ordering::SeqCst)
    }

    /// Most concurrent writes ever seen across all years
    pub fn max_in_flight_total(&self) -> usize {
        self.max_in_flight_total.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Result<(), SyncError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn simulate_write(&self, year: i32) {
        let latency = *self.latency.lock().unwrap();
        let Some(latency) = latency else {
            return;
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let for_year = in_flight.entry(year).or_default();
            *for_year += 1;
            self.max_in_flight_year.fetch_max(*for_year, Ordering::SeqCst);
            let total: usize = in_flight.values().sum();
            self.max_in_flight_total.fetch_max(total, Ordering::SeqCst);
        }

        tokio::time::sleep(latency).await;

        if let Some(for_year) = self.in_flight.lock().unwrap().get_mut(&year) {
            *for_year -= 1;
        }
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn get_year_plan(&self, year: i32) -> Result<Option<YearPlan>, SyncError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.next_failure()?;
        Ok(self.stored(year))
    }

    async fn save_year_plan(&self, plan: &YearPlan) -> Result<(), SyncError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.next_failure()?;
        self.simulate_write(plan.year).await;
        self.insert(plan.clone());
        Ok(())
    }

    async fn update_month_content(&self, year: i32, month: &MonthData) -> Result<(), SyncError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        self.next_failure()?;
        self.simulate_write(year).await;

        let mut plans = self.plans.lock().unwrap();
        let plan = plans
            .get_mut(&year)
            .ok_or_else(|| SyncError::UnknownError(format!("no remote plan {}", year)))?;
        if let Some(slot) = plan.months.iter_mut().find(|m| m.index == month.index) {
            *slot = month.clone();
        }
        Ok(())
    }

    async fn delete_year_plan(&self, year: i32) -> Result<(), SyncError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.next_failure()?;
        self.plans.lock().unwrap().remove(&year);
        Ok(())
    }

    async fn list_years(&self) -> Result<Vec<i32>, SyncError> {
        self.next_failure()?;
        let mut years: Vec<i32> = self.plans.lock().unwrap().keys().copied().collect();
        years.sort_unstable();
        Ok(years)
    }
}
