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

use std::io::Read;

use super::integration_test_common::*;
use crate::mail::store::{self, RecipientStatus};
use crate::mail::test_fixture::Fixture;

fn set_up() -> Fixture {
    crate::init_test_log();
    Fixture::new()
}

fn read_inbox(fixture: &Fixture, index: usize) -> String {
    let services = &fixture.services;
    let inbox = services.inboxer.inbox(fixture.alice).unwrap();
    let mut content = String::new();
    services
        .inboxer
        .open(inbox.entry(index).unwrap())
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    content
}

#[test]
fn relay_delivers_to_local_mailbox() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "relay-local");

    let greeting = cxn.read_responses();
    assert_eq!(vec!["220 mx.example.com ready\r\n".to_owned()], greeting);
    cxn.simple_command("HELO client.test", "250 mx.example.com");

    let response = cxn.send_mail(
        "ext@foo.test",
        &["Alice@EXAMPLE.com"],
        "Subject: hi\r\n\r\n..dotted\r\nbody\r\n",
    );
    assert!(response.starts_with("250 2.0.0 queued as "));
    cxn.simple_command("QUIT", "221 2.0.0 bye");

    let content = read_inbox(&fixture, 0);
    assert!(
        content.starts_with(
            "Received: from client.test (192.0.2.3) by mx.example.com; ",
        ),
        "unexpected content: {content:?}",
    );
    assert!(content.ends_with(
        "\r\nReturn-Path: <ext@foo.test>\r\n\
         Subject: hi\r\n\r\n.dotted\r\nbody\r\n",
    ));
    assert!(!fixture.queue.take_wake());
}

#[test]
fn relay_accepts_null_reverse_path() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "relay-null");
    cxn.skip_pleasantries("EHLO client.test");

    let response = cxn.send_mail("", &["alice@example.com"], "bounce\r\n");
    assert!(response.starts_with("250 2.0.0 "));
    assert!(read_inbox(&fixture, 0).contains("\r\nReturn-Path: <>\r\n"));
}

#[test]
fn submission_queues_remote_mail() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "submission-remote");
    cxn.quick_log_in("EHLO client.test", "alice@example.com", "hunter2");

    let response = cxn.send_mail(
        "alice@example.com",
        &["bob@remote.test"],
        "Subject: out\r\n\r\nhi\r\n",
    );
    assert!(response.starts_with("250 2.0.0 queued as "));
    assert!(fixture.queue.take_wake());

    let mut store = fixture.services.store.borrow_mut();
    let tx = store.read_tx().unwrap();
    let pending = store::fetch_pending_mails(&tx, 10).unwrap();
    assert_eq!(1, pending.len());
    assert_eq!(
        format!("250 2.0.0 queued as {}\r\n", pending[0].id),
        response,
    );
    assert_eq!("alice@example.com", pending[0].return_path);
    assert_eq!(0, pending[0].attempt_count);

    let recipients =
        store::fetch_recipients(&tx, pending[0].id, None).unwrap();
    assert_eq!(1, recipients.len());
    assert_eq!("bob@remote.test", recipients[0].forward_path);
    assert_eq!(None, recipients[0].mailbox_id);
    assert_eq!(RecipientStatus::Pending, recipients[0].status);
}

#[test]
fn submission_to_unknown_local_address() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "submission-unknown");
    cxn.quick_log_in("EHLO client.test", "alice@example.com", "hunter2");

    cxn.simple_command("MAIL FROM:<alice@example.com>", "250 2.1.0");
    cxn.simple_command("RCPT TO:<bob@remote.test>", "250 2.1.5");
    cxn.simple_command("RCPT TO:<nobody@example.com>", "250 2.1.5");
    cxn.simple_command("DATA", "354 ");
    cxn.write_line("hello\r\n.\r\n");
    let responses = cxn.read_responses();
    assert!(responses[0].starts_with("550 5.1.1 "));

    assert!(!fixture.queue.take_wake());
    let mut store = fixture.services.store.borrow_mut();
    let tx = store.read_tx().unwrap();
    assert!(store::fetch_pending_mails(&tx, 10).unwrap().is_empty());
}

#[test]
fn starttls_resets_session() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "starttls");
    cxn.read_responses();

    cxn.write_line("EHLO client.test\r\n");
    let responses = cxn.read_responses();
    assert_eq!("250-mx.example.com\r\n", responses[0]);
    assert!(responses.contains(&"250-STARTTLS\r\n".to_owned()));
    assert!(responses.contains(&"250-AUTH PLAIN LOGIN\r\n".to_owned()));
    assert!(responses.contains(&"250-SIZE 1024\r\n".to_owned()));
    assert_eq!("250 ENHANCEDSTATUSCODES\r\n", responses.last().unwrap());

    cxn.simple_command("MAIL FROM:<ext@foo.test>", "250 2.1.0");
    cxn.simple_command("STARTTLS", "220 2.0.0");
    cxn.start_tls();

    // The transaction and the greeting are forgotten
    cxn.simple_command("RCPT TO:<alice@example.com>", "503 5.5.1");
    cxn.simple_command("MAIL FROM:<ext@foo.test>", "503 5.5.1");

    cxn.write_line("EHLO client.test\r\n");
    let responses = cxn.read_responses();
    assert!(!responses.iter().any(|r| r.contains("STARTTLS")));
    cxn.simple_command("STARTTLS", "454 4.7.0");

    let response =
        cxn.send_mail("ext@foo.test", &["alice@example.com"], "secret\r\n");
    assert!(response.starts_with("250 2.0.0 "));
}

#[test]
fn relay_to_unknown_local_address_rejected() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "relay-unknown");
    cxn.skip_pleasantries("HELO client.test");

    cxn.simple_command("MAIL FROM:<ext@foo.test>", "250 2.1.0");
    cxn.simple_command(
        "RCPT TO:<nobody@example.com>",
        "550 5.1.1 never heard of that person",
    );
    cxn.simple_command(
        "RCPT TO:<bob@remote.test>",
        "550 5.1.1 never heard of that person",
    );
    cxn.simple_command("RCPT TO:<no-at-sign>", "553 5.1.3");
    cxn.simple_command("DATA", "503 5.5.1");
    cxn.simple_command("RCPT TO:<bob@example.com>", "250 2.1.5");
}

#[test]
fn submission_from_wrong_identity_rejected() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "submission-identity");
    cxn.quick_log_in("EHLO client.test", "alice@example.com", "hunter2");

    cxn.simple_command(
        "MAIL FROM:<bob@example.com>",
        "530 5.7.1 that does not sound like you",
    );
    cxn.simple_command(
        "MAIL FROM:<ext@foo.test>",
        "530 5.7.1 that does not sound like you",
    );
    cxn.simple_command("MAIL FROM:<alice@example.com>", "250 2.1.0");
}

#[test]
fn relay_with_local_sender_rejected() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "relay-identity");
    cxn.skip_pleasantries("HELO client.test");

    cxn.simple_command(
        "MAIL FROM:<alice@example.com>",
        "530 5.7.1 that does not sound like you",
    );
    cxn.simple_command("MAIL FROM:<nobody@example.com>", "530 5.7.1");
    cxn.simple_command("MAIL FROM:<bad address>", "553 5.1.7");
}

#[test]
fn authentication() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "auth");
    cxn.read_responses();

    let plain = |user: &str, password: &str| {
        base64::encode(format!("{user}\0{user}\0{password}"))
    };

    cxn.simple_command(
        &format!("AUTH PLAIN {}", plain("bob@example.com", "swordfish")),
        "503 5.5.1",
    );

    cxn.write_line("EHLO client.test\r\n");
    cxn.read_responses();

    cxn.simple_command("AUTH CRAM-MD5", "504 5.5.4");
    cxn.simple_command("AUTH PLAIN", "334 ");
    cxn.simple_command("*", "501 5.7.0");
    cxn.simple_command("AUTH PLAIN", "334 ");
    cxn.simple_command("!!!", "501 5.5.2");
    cxn.simple_command(
        &format!("AUTH PLAIN {}", plain("bob@example.com", "hunter2")),
        "535 5.7.8",
    );
    cxn.simple_command(
        &format!("AUTH PLAIN {}", plain("nobody@example.com", "hunter2")),
        "535 5.7.8",
    );

    cxn.simple_command("AUTH LOGIN", "334 VXNlcm5hbWU6");
    cxn.simple_command(&base64::encode("Bob@Example.com"), "334 UGFzc3dvcmQ6");
    cxn.simple_command(&base64::encode("swordfish"), "235 2.7.0");

    cxn.simple_command(
        &format!("AUTH PLAIN {}", plain("bob@example.com", "swordfish")),
        "503 5.5.1",
    );
    cxn.simple_command("MAIL FROM:<bob@example.com>", "250 2.1.0");
    cxn.simple_command("AUTH LOGIN", "503 5.5.1");
}

#[test]
fn message_size_limits() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "size");
    cxn.skip_pleasantries("EHLO client.test");

    cxn.simple_command("MAIL FROM:<ext@foo.test> SIZE=1025", "552 5.3.4");

    let exact = format!("{}\r\n", "x".repeat(1022));
    let response =
        cxn.send_mail("ext@foo.test", &["alice@example.com"], &exact);
    assert!(response.starts_with("250 2.0.0 "), "got {response:?}");

    let over = format!("{}\r\n", "x".repeat(1023));
    let response =
        cxn.send_mail("ext@foo.test", &["alice@example.com"], &over);
    assert!(response.starts_with("552 5.2.3 "), "got {response:?}");

    // Still usable afterwards, and back in the HELO state
    cxn.simple_command("RCPT TO:<alice@example.com>", "503 5.5.1");
    cxn.simple_command("MAIL FROM:<ext@foo.test> SIZE=1024", "250 2.1.0");

    let inbox = fixture.services.inboxer.inbox(fixture.alice).unwrap();
    assert_eq!(1, inbox.count());
}

#[test]
fn command_errors() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "errors");
    cxn.read_responses();

    cxn.simple_command("MAIL FROM:<ext@foo.test>", "503 5.5.1");
    cxn.simple_command("XYZZY", "500 5.5.1");
    cxn.simple_command("MAIL FROM ext@foo.test", "501 5.5.4");
    cxn.simple_command("HELO client.test", "250 ");
    cxn.simple_command("VRFY alice", "252 2.7.0 maybe");
    cxn.simple_command("NOOP", "250 2.0.0");
    cxn.simple_command("MAIL FROM:<ext@foo.test>", "250 2.1.0");
    cxn.simple_command("MAIL FROM:<ext@foo.test>", "250 2.1.0");
    cxn.simple_command("RCPT TO:<alice@example.com>", "250 2.1.5");
    cxn.simple_command("MAIL FROM:<ext@foo.test>", "503 5.5.1");
    cxn.simple_command("RSET", "250 2.0.0");
    cxn.simple_command("DATA", "503 5.5.1");

    cxn.write_line(&format!("NOOP {}\r\n", "x".repeat(2000)));
    let responses = cxn.read_responses();
    assert!(responses[0].starts_with("500 5.5.0"));
    cxn.simple_command("QUIT", "221 2.0.0");
    assert!(cxn.at_eof());
}

#[test]
fn too_many_ineffective_commands() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "ineffective");
    cxn.skip_pleasantries("HELO client.test");

    for _ in 0..29 {
        cxn.simple_command("NOOP", "250 ");
    }
    cxn.simple_command("NOOP", "421 4.5.0");
    assert!(cxn.at_eof());
}

#[test]
fn http_request_closes_connection() {
    let fixture = set_up();
    let mut cxn = connect_smtp(&fixture, "http");
    cxn.read_responses();

    cxn.write_line("GET / HTTP/1.1\r\n");
    assert!(cxn.at_eof());
}
