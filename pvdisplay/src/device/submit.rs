// Copyright (c) 2026 The pvdisplay developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{Device, IoPort};
use crate::{
    command::{Command, CommandKind},
    drawable::Drawable,
    memory::LocalAddress,
    ring::Ring,
    sync::Event,
};
use std::time::Duration;
use tracing::{debug, error, trace};

/// How long the cursor producer waits for room before complaining.
const CURSOR_RING_TIMEOUT: Duration = Duration::from_secs(1);

impl Device {
    /// Pushes a fully resolved drawable onto the command ring.
    ///
    /// Blocks for as long as the ring stays full and the device is active. A drawable that can't
    /// be pushed because the device went inactive is discarded.
    pub(crate) fn push_drawable(&self, drawable: Drawable) {
        debug_assert!(!drawable.has_pending_chunks());

        let command = Command::new(
            CommandKind::Draw,
            self.translator.to_device(drawable.output()),
        );

        let published = {
            let _guard = self.cmd_lock.lock();

            self.publish(
                &self.ram_header.command_ring,
                command,
                IoPort::NotifyCmd,
                || self.display_event.wait(),
            )
        };

        if !published {
            debug!("device went inactive while the command ring was full");
            self.discard_drawable(drawable);
        }
    }

    /// Pushes a cursor command onto the cursor ring. The output is released instead if the device
    /// goes inactive while the ring is full.
    pub(crate) fn push_cursor_command(&self, output: LocalAddress) {
        let command = Command::new(CommandKind::Cursor, self.translator.to_device(output));
        let ring = &self.ram_header.cursor_ring;

        let published = {
            let _guard = self.cursor_lock.lock();

            self.publish(ring, command, IoPort::NotifyCursor, || {
                wait_for_cursor_ring(&self.cursor_event, ring)
            })
        };

        if !published {
            debug!("device went inactive while the cursor ring was full");
            self.release_output(output);
        }
    }

    // The caller holds the ring's producer lock. Returns `false` if the device went inactive
    // while waiting for room.
    fn publish<const N: usize>(
        &self,
        ring: &Ring<Command, N>,
        mut command: Command,
        port: IoPort,
        mut wait: impl FnMut(),
    ) -> bool {
        loop {
            while ring.prod_wait() {
                if !self.is_active() {
                    return false;
                }

                wait();
            }

            // SAFETY: The caller holds the producer lock of this ring.
            match unsafe { ring.push(command) } {
                Ok(notify) => {
                    trace!(?port, notify, "command published");

                    if notify {
                        self.sync_io(port, 0);
                    }

                    return true;
                }
                Err(rejected) => command = rejected,
            }
        }
    }
}

fn wait_for_cursor_ring<const N: usize>(event: &Event, ring: &Ring<Command, N>) {
    event.wait_timeout(CURSOR_RING_TIMEOUT);

    if ring.is_full() {
        error!("timed out waiting for room in the cursor ring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ram::CURSOR_RING_SIZE,
        resource::OutputKind,
        tests::{create_device, pop_command, raise, TestDevice},
        InterruptReasons,
    };
    use std::thread;

    #[test]
    fn notifies_a_sleeping_consumer() {
        let TestDevice { device, port, .. } = create_device();
        let ring = &device.ram_header().cursor_ring;

        // The device went to sleep on an empty ring.
        assert!(ring.cons_wait());

        let first = device.new_output(OutputKind::Cursor, 40).unwrap();
        device.push_cursor_command(first);
        assert_eq!(port.writes().last(), Some(&(IoPort::NotifyCursor, 0)));

        // It is still awake for the second one.
        let count = port.writes().len();
        let second = device.new_output(OutputKind::Cursor, 40).unwrap();
        device.push_cursor_command(second);
        assert_eq!(port.writes().len(), count);

        let command = pop_command(ring).unwrap();
        assert_eq!(command.kind, CommandKind::Cursor as u32);
        assert_eq!(device.translator().to_local(command.data()), first);

        device.shutdown();
    }

    #[test]
    fn full_cursor_ring_waits_for_the_device() {
        let TestDevice { device, .. } = create_device();
        let ring = &device.ram_header().cursor_ring;

        for _ in 0..CURSOR_RING_SIZE {
            let output = device.new_output(OutputKind::Cursor, 40).unwrap();
            device.push_cursor_command(output);
        }
        assert!(ring.is_full());

        thread::scope(|scope| {
            let last = device.new_output(OutputKind::Cursor, 40).unwrap();
            let producer = scope.spawn({
                let device = &device;
                move || device.push_cursor_command(last)
            });

            thread::sleep(Duration::from_millis(50));
            assert!(!producer.is_finished());

            // The device consumes one command and raises a cursor interrupt.
            pop_command(ring).unwrap();
            raise(&device, InterruptReasons::CURSOR);
            producer.join().unwrap();
        });

        assert!(ring.is_full());

        device.shutdown();
    }

    #[test]
    fn inactive_device_drops_the_waiting_command() {
        let TestDevice { device, .. } = create_device();
        let ring = &device.ram_header().cursor_ring;

        for _ in 0..CURSOR_RING_SIZE {
            let output = device.new_output(OutputKind::Cursor, 40).unwrap();
            device.push_cursor_command(output);
        }

        thread::scope(|scope| {
            let last = device.new_output(OutputKind::Cursor, 40).unwrap();
            let producer = scope.spawn({
                let device = &device;
                move || device.push_cursor_command(last)
            });

            thread::sleep(Duration::from_millis(50));
            device.set_active(false);
            device.cursor_event.set();
            producer.join().unwrap();

            assert!(!device.mem.lock().outputs.contains_key(&last));
        });

        assert_eq!(ring.produced(), CURSOR_RING_SIZE as u32);
        assert_eq!(device.mem.lock().outputs.len(), CURSOR_RING_SIZE);

        device.shutdown();
    }
}
