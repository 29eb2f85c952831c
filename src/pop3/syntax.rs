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

use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// USER name
    User(String),
    /// PASS password, which may contain spaces
    Pass(String),
    /// STAT
    Stat,
    /// LIST [msg]
    List(Option<usize>),
    /// UIDL [msg]
    Uidl(Option<usize>),
    /// RETR msg
    Retr(usize),
    /// DELE msg
    Dele(usize),
    /// RSET
    Rset,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// STLS
    Stls,
    /// CAPA
    Capa,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    UnknownCommand,
    /// The verb is known but its argument is missing or malformed.
    BadArgument,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        let (verb, arg) = match s.split_once(' ') {
            Some((verb, arg)) => (verb, Some(arg)),
            None => (s, None),
        };
        let verb = verb.to_ascii_uppercase();

        let no_arg = |cmd: Command| match arg {
            None => Ok(cmd),
            Some(_) => Err(ParseError::BadArgument),
        };
        let text_arg = || match arg {
            Some(arg) if !arg.is_empty() => Ok(arg.to_owned()),
            _ => Err(ParseError::BadArgument),
        };
        let number = || {
            arg.and_then(|a| a.trim().parse::<usize>().ok())
                .ok_or(ParseError::BadArgument)
        };
        let optional_number = || match arg {
            None => Ok(None),
            Some(_) => number().map(Some),
        };

        match &*verb {
            "USER" => text_arg().map(Command::User),
            "PASS" => text_arg().map(Command::Pass),
            "STAT" => no_arg(Command::Stat),
            "LIST" => optional_number().map(Command::List),
            "UIDL" => optional_number().map(Command::Uidl),
            "RETR" => number().map(Command::Retr),
            "DELE" => number().map(Command::Dele),
            "RSET" => no_arg(Command::Rset),
            "NOOP" => no_arg(Command::Noop),
            "QUIT" => no_arg(Command::Quit),
            "STLS" => no_arg(Command::Stls),
            "CAPA" => no_arg(Command::Capa),
            _ => Err(ParseError::UnknownCommand),
        }
    }
}
