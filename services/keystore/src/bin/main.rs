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
use std::error::Error;

use keystore::{
    config::KeystoreSettings, writer::writer_for, Generation, KeystoreGenerator,
};

/// The settings file read when no path is given on the command line.
const SETTINGS_FILE_PATH: &str = "Keystore.toml";

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let settings_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| SETTINGS_FILE_PATH.to_string());
    log::info!("Loading keystore settings from `{}`", settings_path);
    let settings = KeystoreSettings::load(&settings_path)?;

    let generator = KeystoreGenerator::new(settings.generation, writer_for(&settings.destination));
    match generator.generate_if_needed()? {
        Generation::Skipped => log::info!("Keystore already present, nothing to do"),
        Generation::Stored(keystore) => log::info!(
            "Keystore `{}` ready, certificate:\n{}",
            keystore.destination,
            keystore.certificate.pem()
        ),
    }
    Ok(())
}
