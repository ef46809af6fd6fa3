// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// An auto-reset event.
///
/// Setting the event wakes one waiter, or the next thread to wait if nobody is waiting yet. The
/// event is cleared again by whoever consumes it.
#[derive(Debug, Default)]
pub(crate) struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.signaled.lock() = true;
        self.condvar.notify_one();
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();

        while !*signaled {
            self.condvar.wait(&mut signaled);
        }

        *signaled = false;
    }

    /// Returns `false` if the timeout elapsed without the event being set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();

        while !*signaled {
            if self
                .condvar
                .wait_until(&mut signaled, deadline)
                .timed_out()
            {
                break;
            }
        }

        std::mem::replace(&mut *signaled, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn set_before_wait() {
        let event = Event::new();
        event.set();
        event.wait();
        assert!(!event.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn wakes_a_waiter() {
        let event = Arc::new(Event::new());
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait_timeout(Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        event.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn times_out() {
        let event = Event::new();
        let start = Instant::now();
        assert!(!event.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
