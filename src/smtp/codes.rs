//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailroom.
//
// Mailroom is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailroom is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailroom. If not, see <http://www.gnu.org/licenses/>.

//! Response codes from RFC 5321 and RFC 4954, and extended response codes
//! from RFC 3463.
//!
//! The module is designed to be wildcard-imported, and defines submodules with
//! short names for accessing the enum values in a consistent way.
#![allow(dead_code)]

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PrimaryCode {
    // In the order RFC 5321 defines them
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParemeterNotImplemented = 504,
    ServiceReady = 220,
    ServiceClosing = 221,
    ServiceNotAvailableClosing = 421,
    Ok = 250,
    CannotVerify = 252,
    ActionNotTakenTemporary = 450,
    ActionNotTakenPermanent = 550,
    ActionAborted = 451,
    // Also TooManyRecipients
    InsufficientStorage = 452,
    ExceededStorageAllocation = 552,
    MailboxNameNotAllowed = 553,
    StartMailInput = 354,
    TransactionFailed = 554,
    // RFC 4954
    AuthSucceeded = 235,
    AuthContinue = 334,
    TemporaryAuthFailure = 454,
    AuthRequired = 530,
    AuthCredentialsInvalid = 535,
}

pub mod pc {
    pub use super::PrimaryCode::*;
}

impl PrimaryCode {
    /// The class of the enhanced status code that goes with this reply.
    pub fn class(self) -> ClassCode {
        match self as u16 {
            200..=399 => ClassCode::Success,
            400..=499 => ClassCode::TempFail,
            _ => ClassCode::PermFail,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClassCode {
    Success = 2,
    TempFail = 4,
    PermFail = 5,
}

pub mod cc {
    pub use super::ClassCode::*;
}

/// The subject and detail of an enhanced status code, encoded as
/// `subject * 100 + detail`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum SubjectCode {
    Undefined = 0,
    OtherAddressStatus = 100,
    BadDestinationMailboxAddress = 101,
    BadDestinationMailboxAddressSyntax = 103,
    DestinationAddressValid = 105,
    BadSenderMailboxAddressSyntax = 107,
    OtherMailboxStatus = 200,
    MessageLengthExceedsLimit = 203,
    OtherMailSystem = 300,
    MessageTooBigForSystem = 304,
    OtherNetwork = 400,
    DirectoryServerFailure = 403,
    OtherProtocolStatus = 500,
    InvalidCommand = 501,
    SyntaxError = 502,
    TooManyRecipients = 503,
    InvalidCommandArguments = 504,
    OtherSecurity = 700,
    DeliveryNotAuthorised = 701,
    SecurityFeaturesNotSupported = 704,
    AuthCredentialsInvalid = 708,
    SpfValidationFailed = 723,
}

pub mod sc {
    pub use super::SubjectCode::*;
}

impl SubjectCode {
    pub fn subject(self) -> u16 {
        self as u16 / 100
    }

    pub fn detail(self) -> u16 {
        self as u16 % 100
    }
}

/// The full `class.subject.detail` form of an enhanced status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnhancedCode(pub ClassCode, pub SubjectCode);

impl fmt::Display for EnhancedCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.0 as u8,
            self.1.subject(),
            self.1.detail(),
        )
    }
}
