// Copyright (C) 2024 Nicola Dardanis <nicdard@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::sync::Mutex;

/// Diagnostics emitted while generating a keystore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The alias was blank and has been replaced by the given fallback.
    DefaultedAlias(String),
    /// The store type was blank and has been replaced by the given default.
    DefaultedStoreType(String),
    /// The keystore has been written to `destination` and holds `alias`.
    Created { destination: String, alias: String },
}

/// Receives the diagnostics of a generation run.
pub trait Reporter {
    fn report(&self, event: &Event);
}

/// Forward events to the [`log`] facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: &Event) {
        match event {
            Event::DefaultedAlias(alias) => log::warn!("Defaulting keystore alias `{}`", alias),
            Event::DefaultedStoreType(store_type) => {
                log::warn!("Defaulting keystore type `{}`", store_type)
            }
            Event::Created { destination, alias } => log::info!(
                "Created keystore `{}` with key alias `{}`",
                destination,
                alias
            ),
        }
    }
}

/// Keep every event in memory, in the order they were reported.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<Event>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the events reported so far.
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, event: &Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
