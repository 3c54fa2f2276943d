// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command engine: resolves parsed commands against a registry of
//! addressable controls and composes reply frames.
//!
//! The catalog of concrete control types lives outside this crate;
//! anything implementing [`Control`] can be registered. Unknown or
//! late-arriving commands for removed controls are dropped silently,
//! which is expected steady-state behavior, not an error.

use crate::protocol::{
    self, VERB_CFG, VERB_CONNECT, VERB_MSSG, VERB_NAME, VERB_STATUS, VERB_WHO,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Control type tag that contributes to the `CFG` page count.
const PAGE_TYPE: &str = "PAGE";

/// An addressable capability representing one controllable unit.
///
/// Registered under the composite key `"<type>_<id>"`. `receive` is
/// fire-and-forget and must not panic past this boundary.
pub trait Control: Send + Sync {
    /// Control type tag, e.g. `TBOX`.
    fn control_type(&self) -> &str;

    /// Control instance id, unique within a type.
    fn control_id(&self) -> &str;

    /// Deliver inbound command arguments to this control.
    fn receive(&self, args: &[&str]);

    /// Current-state serialization, or `None` when there is nothing to
    /// report.
    fn current_state(&self) -> Option<String>;

    /// Configuration serialization (opaque to the engine).
    fn configuration(&self) -> String;

    /// Composite registry key.
    fn key(&self) -> String {
        format!("{}_{}", self.control_type(), self.control_id())
    }
}

/// The device display-name handler targeted by the `NAME` verb.
struct DeviceName {
    name: RwLock<String>,
}

impl DeviceName {
    fn new(name: &str) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
        }
    }

    fn get(&self) -> String {
        self.name.read().clone()
    }

    fn receive(&self, args: &[&str]) {
        if let Some(name) = args.first() {
            if !name.is_empty() {
                *self.name.write() = (*name).to_string();
            }
        }
    }
}

/// One addressable device: identity plus a registry of controls and
/// alarms, resolving the tab-and-newline command protocol.
///
/// The registry is mutated through [`Device::add_control`] and
/// [`Device::remove_control`] (the external registration surface) and
/// is read-only from the engine's perspective.
pub struct Device {
    device_id: String,
    device_type: String,
    name: DeviceName,
    controls: RwLock<BTreeMap<String, Arc<dyn Control>>>,
    alarms: RwLock<BTreeMap<String, Arc<dyn Control>>>,
}

impl Device {
    /// Create a device with the given identity triple.
    pub fn new(device_type: &str, device_id: &str, device_name: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            name: DeviceName::new(device_name),
            controls: RwLock::new(BTreeMap::new()),
            alarms: RwLock::new(BTreeMap::new()),
        }
    }

    /// This device's identifier.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// This device's type tag.
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Current display name.
    pub fn device_name(&self) -> String {
        self.name.get()
    }

    /// Register a control under its composite key.
    pub fn add_control(&self, control: Arc<dyn Control>) {
        let key = control.key();
        self.controls.write().insert(key, control);
    }

    /// Register an alarm. Alarms contribute configuration only.
    pub fn add_alarm(&self, alarm: Arc<dyn Control>) {
        let key = alarm.key();
        self.alarms.write().insert(key, alarm);
    }

    /// Remove a control by composite key. Returns `true` if present.
    pub fn remove_control(&self, key: &str) -> bool {
        self.controls.write().remove(key).is_some()
    }

    /// Number of registered controls.
    pub fn control_count(&self) -> usize {
        self.controls.read().len()
    }

    /// Process one decoded text frame and return the concatenated
    /// replies, in input order. Malformed lines and commands for other
    /// devices contribute nothing.
    pub fn process_frame(&self, frame: &str) -> String {
        let mut reply = String::new();
        for line in protocol::frame_lines(frame) {
            if let Some(segment) = self.process_line(line) {
                reply.push_str(&segment);
            }
        }
        reply
    }

    fn process_line(&self, line: &str) -> Option<String> {
        let cmd = protocol::parse_line(line)?;

        if cmd.target == VERB_WHO {
            return Some(self.who_reply());
        }
        if cmd.target != self.device_id {
            // Not for us; dropped without reply.
            return None;
        }

        match cmd.verb {
            VERB_CONNECT => Some(self.connect_reply()),
            VERB_STATUS => Some(self.make_status()),
            VERB_CFG => Some(self.make_cfg()),
            VERB_NAME => {
                self.name.receive(&cmd.args);
                None
            }
            other => {
                let control_id = cmd.args.first()?;
                let key = format!("{}_{}", other, control_id);
                match self.controls.read().get(&key) {
                    Some(control) => control.receive(&cmd.args[1..]),
                    None => debug!("no control for key {}, dropping", key),
                }
                None
            }
        }
    }

    /// Fixed connect acknowledgement carrying device id and type.
    pub fn connect_reply(&self) -> String {
        let name = self.name.get();
        protocol::reply_line(&self.device_id, &[VERB_CONNECT, &self.device_type, &name])
    }

    /// Discovery answer carrying the identity triple.
    pub fn who_reply(&self) -> String {
        let name = self.name.get();
        protocol::reply_line(&self.device_id, &[VERB_WHO, &self.device_type, &name])
    }

    fn make_status(&self) -> String {
        let mut reply = String::new();
        for control in self.controls.read().values() {
            if let Some(state) = control.current_state() {
                reply.push_str(&protocol::reply_line(&self.device_id, &[&state]));
            }
        }
        reply
    }

    fn make_cfg(&self) -> String {
        let mut reply = format!(
            "{}\t{}\tDVCE\t{{\"numPages\": {}}}\n",
            self.device_id,
            VERB_CFG,
            self.page_count()
        );
        for control in self.controls.read().values() {
            reply.push_str(&self.cfg_line(control.as_ref()));
        }
        for alarm in self.alarms.read().values() {
            reply.push_str(&self.cfg_line(alarm.as_ref()));
        }
        reply
    }

    fn cfg_line(&self, control: &dyn Control) -> String {
        let cfg = control.configuration();
        protocol::reply_line(&self.device_id, &[VERB_CFG, &cfg])
    }

    fn page_count(&self) -> usize {
        self.controls
            .read()
            .values()
            .filter(|c| c.control_type() == PAGE_TYPE)
            .count()
    }

    /// One control's current-state line, or `None` when the control is
    /// unknown or stateless.
    pub fn control_state_line(&self, key: &str) -> Option<String> {
        let controls = self.controls.read();
        let state = controls.get(key)?.current_state()?;
        Some(protocol::reply_line(&self.device_id, &[&state]))
    }

    /// Compose a popup-message push frame. The caller publishes it to
    /// the `ALL` address.
    pub fn popup_message(&self, title: &str, header: &str, body: &str) -> String {
        protocol::reply_line(&self.device_id, &[VERB_MSSG, title, header, body])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeControl {
        kind: &'static str,
        id: &'static str,
        state: Option<&'static str>,
        received: Mutex<Vec<String>>,
    }

    impl FakeControl {
        fn new(kind: &'static str, id: &'static str, state: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                id,
                state,
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl Control for FakeControl {
        fn control_type(&self) -> &str {
            self.kind
        }

        fn control_id(&self) -> &str {
            self.id
        }

        fn receive(&self, args: &[&str]) {
            self.received
                .lock()
                .push(args.join("|"));
        }

        fn current_state(&self) -> Option<String> {
            self.state
                .map(|s| format!("{}\t{}\t{}", self.kind, self.id, s))
        }

        fn configuration(&self) -> String {
            format!("{}\t{{\"controlID\": \"{}\"}}", self.kind, self.id)
        }
    }

    fn test_device() -> Device {
        Device::new("Gauge", "dev01", "Kitchen")
    }

    #[test]
    fn test_connect_reply_fixed() {
        let device = test_device();
        assert_eq!(
            device.process_frame("dev01\tCONNECT\n"),
            "dev01\tCONNECT\tGauge\tKitchen\n"
        );
    }

    #[test]
    fn test_other_device_dropped() {
        let device = test_device();
        assert_eq!(device.process_frame("dev99\tCONNECT\n"), "");
        assert_eq!(device.process_frame("dev99\tSTATUS\n"), "");
        assert_eq!(device.process_frame("dev99\tANY\tx\ty\n"), "");
    }

    #[test]
    fn test_who_ignores_target() {
        let device = test_device();
        assert_eq!(
            device.process_frame("WHO\n"),
            "dev01\tWHO\tGauge\tKitchen\n"
        );
    }

    #[test]
    fn test_status_skips_stateless_controls() {
        let device = test_device();
        device.add_control(FakeControl::new("TBOX", "tb1", Some("hello")));
        device.add_control(FakeControl::new("BTTN", "b1", None));

        assert_eq!(
            device.process_frame("dev01\tSTATUS\n"),
            "dev01\tTBOX\ttb1\thello\n"
        );
    }

    #[test]
    fn test_cfg_header_and_alarms() {
        let device = test_device();
        device.add_control(FakeControl::new("PAGE", "pg1", None));
        device.add_control(FakeControl::new("TBOX", "tb1", Some("x")));
        device.add_alarm(FakeControl::new("ALRM", "a1", None));

        let reply = device.process_frame("dev01\tCFG\n");
        let lines: Vec<&str> = reply.lines().collect();
        assert_eq!(lines[0], "dev01\tCFG\tDVCE\t{\"numPages\": 1}");
        assert!(lines.contains(&"dev01\tCFG\tTBOX\t{\"controlID\": \"tb1\"}"));
        assert!(lines.contains(&"dev01\tCFG\tALRM\t{\"controlID\": \"a1\"}"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_dispatch_to_registered_control() {
        let device = test_device();
        let control = FakeControl::new("TBOX", "tb1", None);
        device.add_control(control.clone());

        assert_eq!(device.process_frame("dev01\tTBOX\ttb1\tnew\ttext\n"), "");
        assert_eq!(control.received.lock().as_slice(), ["new|text"]);
    }

    #[test]
    fn test_unknown_control_silently_dropped() {
        let device = test_device();
        // No reply, no panic: a command for a control removed earlier.
        assert_eq!(device.process_frame("dev01\tDIAL\td9\t42\n"), "");
    }

    #[test]
    fn test_removed_control_stops_receiving() {
        let device = test_device();
        let control = FakeControl::new("TBOX", "tb1", None);
        device.add_control(control.clone());
        assert!(device.remove_control("TBOX_tb1"));

        device.process_frame("dev01\tTBOX\ttb1\tlate\n");
        assert!(control.received.lock().is_empty());
    }

    #[test]
    fn test_name_verb_updates_display_name() {
        let device = test_device();
        device.process_frame("dev01\tNAME\tPantry\n");
        assert_eq!(device.device_name(), "Pantry");
        assert_eq!(
            device.connect_reply(),
            "dev01\tCONNECT\tGauge\tPantry\n"
        );
    }

    #[test]
    fn test_multi_line_frame_with_malformed_middle() {
        let device = test_device();
        device.add_control(FakeControl::new("TBOX", "tb1", Some("v")));

        let reply = device.process_frame("dev01\tSTATUS\nmalformed\ndev01\tCFG\n");

        // Two independently-generated segments, in input order, with
        // the malformed line silently skipped.
        let expected_status = "dev01\tTBOX\ttb1\tv\n";
        let expected_cfg_header = "dev01\tCFG\tDVCE\t{\"numPages\": 0}\n";
        assert!(reply.starts_with(expected_status));
        assert!(reply[expected_status.len()..].starts_with(expected_cfg_header));
    }

    #[test]
    fn test_popup_message_shape() {
        let device = test_device();
        assert_eq!(
            device.popup_message("Alert", "Oven", "Preheated"),
            "dev01\tMSSG\tAlert\tOven\tPreheated\n"
        );
    }
}
