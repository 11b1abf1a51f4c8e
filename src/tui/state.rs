use crate::model::{InfoEvent, Panel, Snapshot, TimeAxis};
use std::collections::BTreeMap;
use std::time::Duration;

/// How the selected panel's indices are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartLayout {
    /// One chart per index, each with its own y scale.
    #[default]
    Stacked,
    /// All indices on one chart, each normalized to its own range.
    Overlay,
}

impl ChartLayout {
    pub fn toggled(self) -> Self {
        match self {
            ChartLayout::Stacked => ChartLayout::Overlay,
            ChartLayout::Overlay => ChartLayout::Stacked,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChartLayout::Stacked => "stacked",
            ChartLayout::Overlay => "overlay",
        }
    }
}

pub struct UiState {
    pub snapshot: Snapshot,
    /// Outer tabs, in the order they were first seen. Never shrinks.
    pub types: Vec<String>,
    /// Inner tabs per type, same rule.
    pub senders: BTreeMap<String, Vec<String>>,
    // Selection is tracked by name so appended tabs never move it.
    pub selected_type: Option<String>,
    pub selected_sender: BTreeMap<String, String>,
    pub layout: ChartLayout,
    pub time_axis: TimeAxis,
    pub paused: bool,
    pub show_help: bool,
    pub info: String,
    pub db_label: String,
    pub refresh: Duration,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            snapshot: Snapshot::default(),
            types: Vec::new(),
            senders: BTreeMap::new(),
            selected_type: None,
            selected_sender: BTreeMap::new(),
            layout: ChartLayout::default(),
            time_axis: TimeAxis::default(),
            paused: false,
            show_help: false,
            info: "Waiting for data...".into(),
            db_label: String::new(),
            refresh: Duration::from_secs(1),
        }
    }
}

fn step(len: usize, current: usize, forward: bool) -> usize {
    if len == 0 {
        return 0;
    }
    if forward {
        (current + 1) % len
    } else {
        (current + len - 1) % len
    }
}

impl UiState {
    /// Take in a fresh snapshot, appending any tabs not seen before.
    pub fn apply_snapshot(&mut self, snap: Snapshot) {
        let had_tabs = !self.types.is_empty();
        for (packet_type, by_sender) in &snap.panels {
            if !self.types.contains(packet_type) {
                self.types.push(packet_type.clone());
            }
            let known = self.senders.entry(packet_type.clone()).or_default();
            for sender in by_sender.keys() {
                if !known.contains(sender) {
                    known.push(sender.clone());
                }
            }
            if !self.selected_sender.contains_key(packet_type) {
                if let Some(first) = known.first() {
                    self.selected_sender
                        .insert(packet_type.clone(), first.clone());
                }
            }
        }
        if self.selected_type.is_none() {
            self.selected_type = self.types.first().cloned();
        }
        // First data replaces the "waiting" message.
        if !had_tabs && !self.types.is_empty() {
            self.info.clear();
        }
        self.time_axis = snap.time_axis;
        self.snapshot = snap;
    }

    pub fn apply_info(&mut self, info: InfoEvent) {
        if let InfoEvent::Paused(p) = info {
            self.paused = p;
        }
        self.info = info.to_message();
    }

    pub fn type_index(&self) -> usize {
        self.selected_type
            .as_ref()
            .and_then(|t| self.types.iter().position(|x| x == t))
            .unwrap_or(0)
    }

    pub fn sender_tabs(&self) -> &[String] {
        self.selected_type
            .as_ref()
            .and_then(|t| self.senders.get(t))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn current_sender(&self) -> Option<&str> {
        let t = self.selected_type.as_ref()?;
        self.selected_sender.get(t).map(String::as_str)
    }

    pub fn sender_index(&self) -> usize {
        self.current_sender()
            .and_then(|s| self.sender_tabs().iter().position(|x| x == s))
            .unwrap_or(0)
    }

    pub fn cycle_type(&mut self, forward: bool) {
        if self.types.is_empty() {
            return;
        }
        let i = step(self.types.len(), self.type_index(), forward);
        self.selected_type = Some(self.types[i].clone());
    }

    pub fn cycle_sender(&mut self, forward: bool) {
        let tabs = self.sender_tabs();
        if tabs.is_empty() {
            return;
        }
        let next = tabs[step(tabs.len(), self.sender_index(), forward)].clone();
        if let Some(t) = self.selected_type.clone() {
            self.selected_sender.insert(t, next);
        }
    }

    /// The panel behind the current selection, if the last snapshot has it.
    pub fn current_panel(&self) -> Option<&Panel> {
        let t = self.selected_type.as_deref()?;
        let s = self.current_sender()?;
        self.snapshot.panel(t, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, &str)]) -> Snapshot {
        let mut snap = Snapshot::default();
        for (t, s) in pairs {
            snap.panels.entry(t.to_string()).or_default().insert(
                s.to_string(),
                Panel {
                    packet_type: t.to_string(),
                    sender: s.to_string(),
                    ..Default::default()
                },
            );
        }
        snap
    }

    #[test]
    fn first_snapshot_selects_first_tabs() {
        let mut st = UiState::default();
        st.apply_snapshot(snapshot(&[("GPS", "Rocket"), ("BARO", "Rocket")]));
        assert_eq!(st.types, vec!["BARO", "GPS"]);
        assert_eq!(st.selected_type.as_deref(), Some("BARO"));
        assert_eq!(st.current_sender(), Some("Rocket"));
        assert!(st.current_panel().is_some());
    }

    #[test]
    fn tabs_are_only_appended_and_selection_sticks() {
        let mut st = UiState::default();
        st.apply_snapshot(snapshot(&[("GPS", "B")]));
        st.apply_snapshot(snapshot(&[("BARO", "A"), ("GPS", "A"), ("GPS", "B")]));
        // BARO sorts first but was seen later, so it goes after GPS.
        assert_eq!(st.types, vec!["GPS", "BARO"]);
        assert_eq!(st.senders["GPS"], vec!["B", "A"]);
        assert_eq!(st.selected_type.as_deref(), Some("GPS"));
        assert_eq!(st.current_sender(), Some("B"));

        // A later snapshot missing a pair keeps its tab.
        st.apply_snapshot(snapshot(&[("BARO", "A")]));
        assert_eq!(st.types.len(), 2);
        assert_eq!(st.senders["GPS"].len(), 2);
        assert!(st.current_panel().is_none());
    }

    #[test]
    fn cycling_wraps_both_ways() {
        let mut st = UiState::default();
        st.apply_snapshot(snapshot(&[("A", "x"), ("B", "x"), ("B", "y"), ("C", "x")]));
        st.cycle_type(false);
        assert_eq!(st.selected_type.as_deref(), Some("C"));
        st.cycle_type(true);
        st.cycle_type(true);
        assert_eq!(st.selected_type.as_deref(), Some("B"));
        st.cycle_sender(true);
        assert_eq!(st.current_sender(), Some("y"));
        st.cycle_sender(true);
        assert_eq!(st.current_sender(), Some("x"));
        // Each type remembers its own sender.
        st.cycle_sender(false);
        st.cycle_type(true);
        st.cycle_type(false);
        assert_eq!(st.current_sender(), Some("y"));
    }

    #[test]
    fn cycling_with_no_tabs_is_a_no_op() {
        let mut st = UiState::default();
        st.cycle_type(true);
        st.cycle_sender(false);
        assert!(st.selected_type.is_none());
    }

    #[test]
    fn pause_info_updates_flag_and_status() {
        let mut st = UiState::default();
        st.apply_info(InfoEvent::Paused(true));
        assert!(st.paused);
        assert_eq!(st.info, "Paused");
        assert_eq!(ChartLayout::Stacked.toggled(), ChartLayout::Overlay);
    }
}
