//! Memory shared between the bridge caller and its worker

use super::{State, STATE};
use crate::core::config::BridgeConfig;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::{Mutex, MutexGuard};
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::sync::atomic::{AtomicI32, Ordering};

/// Control slots, transfer buffers and bulk buffers of one bridge
///
/// Control slots support load/store plus a futex-style wait: a waiter spins
/// briefly, then parks on the slot's address until the value changes.
pub struct SharedRegion {
    control: [CachePadded<AtomicI32>; 3],
    call: Mutex<Box<[u8]>>,
    response: Mutex<Box<[u8]>>,
    shared: Vec<Mutex<Box<[u8]>>>,
}

impl SharedRegion {
    /// Allocate buffers sized by `config`, all slots zeroed (`IDLE`)
    pub fn new(config: &BridgeConfig) -> Self {
        SharedRegion {
            control: [
                CachePadded::new(AtomicI32::new(State::Idle as i32)),
                CachePadded::new(AtomicI32::new(0)),
                CachePadded::new(AtomicI32::new(0)),
            ],
            call: Mutex::new(vec![0u8; config.call_buffer_size].into_boxed_slice()),
            response: Mutex::new(vec![0u8; config.response_buffer_size].into_boxed_slice()),
            shared: config
                .shared_buffers
                .iter()
                .map(|size| Mutex::new(vec![0u8; *size].into_boxed_slice()))
                .collect(),
        }
    }

    pub fn load(&self, slot: usize) -> i32 {
        self.control[slot].load(Ordering::SeqCst)
    }

    pub fn store(&self, slot: usize, value: i32) {
        self.control[slot].store(value, Ordering::SeqCst);
    }

    /// Store into a slot and wake everyone waiting on it
    pub fn store_notify(&self, slot: usize, value: i32) {
        self.store(slot, value);
        // SAFETY: the key is the address of a slot owned by this region and
        // used for nothing but this wait queue
        unsafe {
            parking_lot_core::unpark_all(self.key(slot), DEFAULT_UNPARK_TOKEN);
        }
    }

    pub fn state(&self) -> i32 {
        self.load(STATE)
    }

    pub fn set_state(&self, state: State) {
        self.store_notify(STATE, state as i32);
    }

    /// Block until `STATE` holds one of `accept`, returning it
    ///
    /// No timeout: the caller has nothing to do but wait.
    pub fn wait_state(&self, accept: &[State]) -> State {
        let backoff = Backoff::new();
        loop {
            let current = self.load(STATE);
            if let Some(state) = accept.iter().find(|s| **s as i32 == current) {
                return *state;
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            // SAFETY: as in `store_notify`; validation runs under the queue
            // lock, so a store + unpark between load and park is not lost
            unsafe {
                parking_lot_core::park(
                    self.key(STATE),
                    || self.load(STATE) == current,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        }
    }

    fn key(&self, slot: usize) -> usize {
        &*self.control[slot] as *const AtomicI32 as usize
    }

    pub fn call_capacity(&self) -> usize {
        self.call.lock().len()
    }

    pub fn response_capacity(&self) -> usize {
        self.response.lock().len()
    }

    pub fn call_buffer(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.call.lock()
    }

    pub fn response_buffer(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.response.lock()
    }

    /// A registered bulk buffer
    pub fn shared_buffer(&self, index: usize) -> Option<MutexGuard<'_, Box<[u8]>>> {
        self.shared.get(index).map(|buffer| buffer.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_wakes_on_state_change() {
        let region = Arc::new(SharedRegion::new(&BridgeConfig::default()));
        let waiter = {
            let region = Arc::clone(&region);
            thread::spawn(move || region.wait_state(&[State::Response, State::AskNext]))
        };

        thread::sleep(std::time::Duration::from_millis(20));
        region.set_state(State::Process);
        region.set_state(State::AskNext);
        assert_eq!(waiter.join().unwrap(), State::AskNext);
    }

    #[test]
    fn test_buffers_follow_config() {
        let config = BridgeConfig::default()
            .with_call_buffer_size(512)
            .with_shared_buffer(64);
        let region = SharedRegion::new(&config);
        assert_eq!(region.call_capacity(), 512);
        assert_eq!(region.response_capacity(), 8 * 1024);
        assert_eq!(region.shared_buffer(0).unwrap().len(), 64);
        assert!(region.shared_buffer(1).is_none());
        assert_eq!(region.state(), State::Idle as i32);
    }
}
