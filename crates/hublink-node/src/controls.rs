// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concrete controls served by the demo node.

use hublink::Control;
use parking_lot::RwLock;
use serde_json::json;

/// Free-text box. Stores whatever the last command wrote to it.
pub struct TextBox {
    control_id: String,
    title: String,
    text: RwLock<String>,
}

impl TextBox {
    pub fn new(control_id: &str, title: &str) -> Self {
        Self {
            control_id: control_id.to_string(),
            title: title.to_string(),
            text: RwLock::new(String::new()),
        }
    }

    pub fn text(&self) -> String {
        self.text.read().clone()
    }
}

impl Control for TextBox {
    fn control_type(&self) -> &str {
        "TBOX"
    }

    fn control_id(&self) -> &str {
        &self.control_id
    }

    fn receive(&self, args: &[&str]) {
        if let Some(text) = args.first() {
            *self.text.write() = (*text).to_string();
        }
    }

    fn current_state(&self) -> Option<String> {
        Some(format!("TBOX\t{}\t{}", self.control_id, self.text.read()))
    }

    fn configuration(&self) -> String {
        let cfg = json!({
            "controlID": self.control_id,
            "title": self.title,
        });
        format!("TBOX\t{}", cfg)
    }
}

/// Layout page grouping other controls. Carries configuration only.
pub struct Page {
    control_id: String,
    title: String,
    control_ids: Vec<String>,
}

impl Page {
    pub fn new(control_id: &str, title: &str, control_ids: &[&str]) -> Self {
        Self {
            control_id: control_id.to_string(),
            title: title.to_string(),
            control_ids: control_ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Control for Page {
    fn control_type(&self) -> &str {
        "PAGE"
    }

    fn control_id(&self) -> &str {
        &self.control_id
    }

    fn receive(&self, _args: &[&str]) {}

    fn current_state(&self) -> Option<String> {
        None
    }

    fn configuration(&self) -> String {
        let cfg = json!({
            "controlID": self.control_id,
            "title": self.title,
            "controls": self.control_ids,
        });
        format!("PAGE\t{}", cfg)
    }
}
