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


//! Parsing of SMTP command lines.

use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// HELO origin-host ignored...
    Helo(String),
    /// EHLO origin-host ignored...
    Ehlo(String),
    /// AUTH mechanism [initial-response]
    Auth(String, Option<String>),
    /// MAIL FROM:<reverse-path> [SIZE=n] [BODY=type]
    MailFrom(MailFrom),
    /// RCPT TO:<[source-route:]forward-path>
    Recipient(Recipient),
    Data,
    Reset,
    /// VRFY string
    Verify,
    /// NOOP [string]
    Noop,
    Quit,
    StartTls,
    /// The first line of an HTTP request.
    Http,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailFrom {
    /// Empty for the null reverse-path.
    pub path: String,
    /// The declared message size, if any.
    pub size: Option<u64>,
    /// Problems with parameters that were ignored.
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Recipient {
    pub path: String,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The verb is not one this server knows.
    UnknownCommand,
    /// The verb is known but the rest of the line is malformed.
    BadArguments,
}

const HTTP_VERBS: &[&str] =
    &["GET", "HEAD", "PUT", "POST", "DELETE", "OPTIONS", "CONNECT"];

/// Parameters longer than this are truncated in warnings.
const MAX_QUOTED_PARAMETER: usize = 64;

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, ParseError> {
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, Some(args)),
            None => (line, None),
        };

        match (verb.to_ascii_uppercase().as_str(), args) {
            ("HELO", Some(args)) => first_word(args).map(Command::Helo),
            ("EHLO", Some(args)) => first_word(args).map(Command::Ehlo),
            ("AUTH", Some(args)) => parse_auth(args),
            ("MAIL", Some(args)) => parse_mail(args).map(Command::MailFrom),
            ("RCPT", Some(args)) => parse_rcpt(args).map(Command::Recipient),
            ("VRFY", Some(_)) => Ok(Command::Verify),
            ("NOOP", _) => Ok(Command::Noop),
            ("DATA", None) => Ok(Command::Data),
            ("RSET", None) => Ok(Command::Reset),
            ("QUIT", None) => Ok(Command::Quit),
            ("STARTTLS", None) => Ok(Command::StartTls),
            (
                "HELO" | "EHLO" | "AUTH" | "MAIL" | "RCPT" | "VRFY" | "DATA"
                | "RSET" | "QUIT" | "STARTTLS",
                _,
            ) => Err(ParseError::BadArguments),
            (verb, _) if HTTP_VERBS.contains(&verb) => Ok(Command::Http),
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

fn first_word(args: &str) -> Result<String, ParseError> {
    args.split(' ')
        .next()
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .ok_or(ParseError::BadArguments)
}

fn parse_auth(args: &str) -> Result<Command, ParseError> {
    let mut parts = args.split(' ');
    let mechanism = parts
        .next()
        .filter(|m| {
            !m.is_empty()
                && m.bytes().all(|b| b.is_ascii_alphanumeric() || b'-' == b)
        })
        .ok_or(ParseError::BadArguments)?;
    let initial = parts.next();
    if parts.next().is_some()
        || initial.is_some_and(|i| {
            i.is_empty()
                || !i.bytes().all(|b| {
                    b.is_ascii_alphanumeric() || b"+/=".contains(&b)
                })
        })
    {
        return Err(ParseError::BadArguments);
    }

    Ok(Command::Auth(
        mechanism.to_ascii_uppercase(),
        initial.map(str::to_owned),
    ))
}

/// Splits `<path> rest` after a case-insensitive `keyword`.
fn bracketed<'a>(
    args: &'a str,
    keyword: &str,
) -> Result<(&'a str, &'a str), ParseError> {
    let rest = args
        .get(..keyword.len())
        .filter(|k| k.eq_ignore_ascii_case(keyword))
        .map(|_| &args[keyword.len()..])
        .and_then(|rest| rest.strip_prefix('<'))
        .ok_or(ParseError::BadArguments)?;
    rest.split_once('>').ok_or(ParseError::BadArguments)
}

fn parse_mail(args: &str) -> Result<MailFrom, ParseError> {
    let (path, params) = bracketed(args, "FROM:")?;
    let mut mail = MailFrom {
        path: path.to_owned(),
        ..MailFrom::default()
    };

    for param in params.split(' ').filter(|p| !p.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        if key.eq_ignore_ascii_case("SIZE") {
            match value.parse::<u64>() {
                Ok(size) => mail.size = Some(size),
                Err(_) => mail.warnings.push(format!(
                    "Ignoring invalid MAIL FROM parameter {:?}",
                    truncate(param),
                )),
            }
        } else if !key.eq_ignore_ascii_case("BODY")
            || !["7BIT", "8BITMIME", "BINARYMIME"]
                .iter()
                .any(|v| v.eq_ignore_ascii_case(value))
        {
            mail.warnings.push(format!(
                "Ignoring unknown MAIL FROM parameter {:?}",
                truncate(param),
            ));
        }
    }

    Ok(mail)
}

fn parse_rcpt(args: &str) -> Result<Recipient, ParseError> {
    let (path, params) = bracketed(args, "TO:")?;
    // Source routes are obsolete and ignored
    let path = match path.split_once(':') {
        Some((route, path)) if route.starts_with('@') => path,
        _ => path,
    };
    if path.is_empty() {
        return Err(ParseError::BadArguments);
    }

    let mut warnings = Vec::new();
    let params = params.trim();
    if !params.is_empty() {
        warnings.push(format!(
            "Ignoring extraneous RCPT TO parameters: {:?}",
            truncate(params),
        ));
    }

    Ok(Recipient {
        path: path.to_owned(),
        warnings,
    })
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(MAX_QUOTED_PARAMETER) {
        Some((ix, _)) => &s[..ix],
        None => s,
    }
}
