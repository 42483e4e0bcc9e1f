mod common;

use common::Client;
use common::start_server;
use common::test_config;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_pipelines_run_and_report_unknown_commands() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("echo hello | cat | cat").await, "hello\n% ");
    assert_eq!(client.run("false | true").await, "% ");
    // The session still works after a pipeline whose first stage failed.
    assert_eq!(client.run("echo still here").await, "still here\n% ");

    assert_eq!(client.run("ctt").await, "Unknown command: [ctt].\n% ");
    assert_eq!(
        client.run("echo skipped | ctt").await,
        "Unknown command: [ctt].\n% "
    );
    assert_eq!(client.run("   ").await, "% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn numbered_pipe_feeds_a_later_line() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("echo numbered |2").await, "% ");
    assert_eq!(client.run("echo between").await, "between\n% ");
    assert_eq!(client.run("cat").await, "numbered\n% ");

    // Consumed: the next Line gets no input.
    assert_eq!(client.run("cat").await, "% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn numbered_pipes_aimed_at_same_line_merge() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    client.run("echo first |2").await;
    client.run("echo second |1").await;
    let out = client.run("cat").await;
    assert!(out.contains("first\n"), "{out:?}");
    assert!(out.contains("second\n"), "{out:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn numbered_markers_split_one_input_into_lines() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("echo inline |1 cat").await, "inline\n% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_pipe_captures_stderr() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("ls /definitely-missing-dir !1").await, "% ");
    let out = client.run("cat").await;
    assert!(out.contains("definitely-missing-dir"), "{out:?}");

    // A plain pipe leaves stderr on the terminal.
    let out = client.run("ls /definitely-missing-dir | cat").await;
    assert!(out.contains("definitely-missing-dir"), "{out:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_command_notice_bypasses_error_pipe() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("ctt !1").await, "Unknown command: [ctt].\n% ");
    // Nothing reached the pipe.
    assert_eq!(client.run("wc -l").await.trim_start(), "0\n% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn builtin_line_ages_numbered_pipes() {
    let addr = start_server(test_config(2)).await;
    let (mut client, _) = Client::connect(addr).await;

    client.run("echo dropped |1").await;
    // The slot is due on this builtin Line, which does not read it.
    client.run("printenv PATH").await;
    assert_eq!(client.run("cat").await, "% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_pipe_delivers_once() {
    let addr = start_server(test_config(4)).await;
    let (mut one, _) = Client::connect(addr).await;
    let (mut two, _) = Client::connect(addr).await;
    one.read_notice("entered from").await;

    let out = two.run("echo hi >1").await;
    assert_eq!(
        out,
        "*** (no name) (#2) just piped 'echo hi >1' to (no name) (#1) ***\n% "
    );
    one.read_notice("just piped").await;

    let out = one.run("cat <2").await;
    assert_eq!(
        out,
        "*** (no name) (#1) just received from (no name) (#2) by 'cat <2' ***\nhi\n% "
    );
    two.read_notice("just received").await;

    let out = one.run("cat <2").await;
    assert_eq!(out, "*** Error: the pipe #2->#1 does not exist yet. ***\n% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_pipe_errors_do_not_block() {
    let addr = start_server(test_config(4)).await;
    let (mut one, _) = Client::connect(addr).await;
    let (mut two, _) = Client::connect(addr).await;
    one.read_notice("entered from").await;

    assert_eq!(
        one.run("cat <2").await,
        "*** Error: the pipe #2->#1 does not exist yet. ***\n% "
    );
    assert_eq!(
        one.run("cat <7").await,
        "*** Error: user #7 does not exist yet. ***\n% "
    );
    assert_eq!(
        one.run("echo lost >7").await,
        "*** Error: user #7 does not exist yet. ***\n% "
    );

    two.run("echo once >1").await;
    one.read_notice("just piped").await;
    let out = two.run("echo twice >1").await;
    assert_eq!(out, "*** Error: the pipe #2->#1 already exists. ***\n% ");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn departing_session_drops_its_user_pipes() {
    let addr = start_server(test_config(4)).await;
    let (mut one, _) = Client::connect(addr).await;
    let (mut two, _) = Client::connect(addr).await;
    one.read_notice("entered from").await;

    two.run("echo orphan >1").await;
    one.read_notice("just piped").await;
    two.send("exit").await;
    two.read_to_end().await;
    one.read_notice("left").await;

    assert_eq!(
        one.run("cat <2").await,
        "*** Error: user #2 does not exist yet. ***\n% "
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_redirection_writes_stage_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(2);
    config.working_dir = Some(dir.path().to_path_buf());
    let addr = start_server(config).await;
    let (mut client, _) = Client::connect(addr).await;

    assert_eq!(client.run("echo saved > out.txt").await, "% ");
    assert_eq!(client.run("cat out.txt").await, "saved\n% ");
}
