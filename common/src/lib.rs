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

//! Key material and certificate primitives shared by the keystore services.

pub mod certificate;
pub mod crypto;
pub mod pkcs12;

pub use certificate::{create_self_signed_certificate, subject_for_host, Certificate};
pub use crypto::{
    find_signature_algorithm_identifier, Error, KeyPair, PrivateKeyDer, SignatureAlgorithm,
};
