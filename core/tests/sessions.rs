mod common;

use common::Client;
use common::start_server;
use common::test_config;
use npshell_core::notice::WELCOME_BANNER;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn greeting_has_banner_login_notice_and_prompt() {
    let addr = start_server(test_config(4)).await;
    let (_client, greeting) = Client::connect(addr).await;

    assert!(greeting.starts_with(WELCOME_BANNER), "{greeting:?}");
    assert!(
        greeting.contains("*** User '(no name)' entered from 127.0.0.1:"),
        "{greeting:?}"
    );
    assert!(greeting.ends_with("% "), "{greeting:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_rejects_collision_and_broadcasts_success() {
    let addr = start_server(test_config(4)).await;
    let (mut alice, _) = Client::connect(addr).await;
    let (mut other, _) = Client::connect(addr).await;
    alice.read_notice("entered from").await;

    let out = alice.run("name alice").await;
    assert!(out.contains("is named 'alice'. ***"), "{out:?}");
    other.read_notice("is named 'alice'. ***").await;

    let out = other.run("name alice").await;
    assert_eq!(out, "*** User 'alice' already exists. ***\n% ");

    let out = other.run("name bob").await;
    let notice_start = out.find("*** User from 127.0.0.1:").expect("rename notice");
    assert!(out[notice_start..].starts_with("*** User from 127.0.0.1:"));
    assert!(out.ends_with("is named 'bob'. ***\n% "), "{out:?}");
    alice.read_until("is named 'bob'. ***\n").await;

    let who = alice.run("who").await;
    let rows: Vec<&str> = who.lines().collect();
    assert_eq!(rows[0], "<ID>\t<nickname>\t<IP:port>\t<indicate me>");
    assert!(rows[1].starts_with("1\talice\t127.0.0.1:"), "{who:?}");
    assert!(rows[1].ends_with("\t<-me"), "{who:?}");
    assert!(rows[2].starts_with("2\tbob\t127.0.0.1:"), "{who:?}");
    assert!(rows[2].ends_with('\t'), "{who:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tell_to_missing_user_reports_error_only_to_sender() {
    let addr = start_server(test_config(4)).await;
    let (mut sender, _) = Client::connect(addr).await;

    let out = sender.run("tell 2 hello").await;
    assert_eq!(out, "*** Error: user #2 does not exist yet. ***\n% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tell_and_yell_deliver_messages() {
    let addr = start_server(test_config(4)).await;
    let (mut one, _) = Client::connect(addr).await;
    let (mut two, _) = Client::connect(addr).await;
    one.read_notice("entered from").await;

    let out = one.run("tell 2 hello   there").await;
    assert_eq!(out, "% ");
    two.read_until("*** (no name) told you ***: hello   there\n")
        .await;

    let out = two.run("yell anyone home?").await;
    assert_eq!(out, "*** (no name) yelled ***: anyone home?\n% ");
    one.read_until("*** (no name) yelled ***: anyone home?\n").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn environment_builtins() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("printenv PATH").await, "/bin:/usr/bin\n% ");
    assert_eq!(client.run("printenv UNSET").await, "% ");
    assert_eq!(client.run("setenv GREETING hi").await, "% ");
    assert_eq!(client.run("printenv GREETING").await, "hi\n% ");

    // Stages see exactly the session environment.
    let out = client.run("env").await;
    assert!(out.contains("GREETING=hi\n"), "{out:?}");
    assert!(out.contains("PATH=/bin:/usr/bin\n"), "{out:?}");

    client.run("setenv PATH /nonexistent").await;
    assert_eq!(client.run("ls").await, "Unknown command: [ls].\n% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capacity_is_enforced_and_ids_are_reused() {
    let addr = start_server(test_config(2)).await;
    let (mut one, _) = Client::connect(addr).await;
    let (mut two, _) = Client::connect(addr).await;
    one.read_notice("entered from").await;

    let mut rejected = Client::connect_raw(addr).await;
    assert_eq!(
        rejected.read_to_end().await,
        "*** Error: online users are up to limit (2). ***\n"
    );

    // Existing sessions are unaffected.
    assert_eq!(one.run("printenv PATH").await, "/bin:/usr/bin\n% ");

    two.send("exit").await;
    let farewell = two.read_to_end().await;
    assert!(farewell.contains("*** User '(no name)' left. ***"), "{farewell:?}");
    one.read_until("*** User '(no name)' left. ***\n").await;

    let (mut three, greeting) = Client::connect(addr).await;
    assert!(greeting.contains("entered from"), "{greeting:?}");
    let who = three.run("who").await;
    let me = who
        .lines()
        .find(|row| row.ends_with("<-me"))
        .expect("own row");
    assert!(me.starts_with("2\t"), "{who:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_without_exit_announces_leave() {
    let addr = start_server(test_config(3)).await;
    let (mut stays, _) = Client::connect(addr).await;
    let (leaves, _) = Client::connect(addr).await;
    stays.read_notice("entered from").await;

    drop(leaves);
    stays.read_until("*** User '(no name)' left. ***\n").await;
    let who = stays.run("who").await;
    assert_eq!(who.lines().count(), 2, "{who:?}");
}
