use super::*;

fn retry_prompt() -> DialogRequest {
    DialogRequest::new("Download failed.\nRetry?")
        .primary_button("Retry")
        .button("Skip")
}

#[test]
fn answers_by_number_label_or_cancel() {
    let request = retry_prompt();
    assert_eq!(
        parse_answer(&request, "1"),
        Some(Answer::Button("Retry".into()))
    );
    assert_eq!(
        parse_answer(&request, " skip "),
        Some(Answer::Button("Skip".into()))
    );
    assert_eq!(parse_answer(&request, "C"), Some(Answer::Cancel));
}

#[test]
fn out_of_range_or_unknown_answers_are_rejected() {
    let request = retry_prompt();
    assert_eq!(parse_answer(&request, "0"), None);
    assert_eq!(parse_answer(&request, "3"), None);
    assert_eq!(parse_answer(&request, "maybe"), None);
}

#[test]
fn http_base_follows_the_websocket_endpoint() {
    let base = http_base("ws://10.1.2.3:7341/ws?epoch=4").expect("base");
    assert_eq!(base.as_str(), "http://10.1.2.3:7341/");
    assert_eq!(
        base.join("status").expect("join").as_str(),
        "http://10.1.2.3:7341/status"
    );

    let secure = http_base("wss://station.local/ws").expect("base");
    assert_eq!(secure.as_str(), "https://station.local/");
}

#[test]
fn http_base_rejects_non_websocket_endpoints() {
    let err = http_base("tcp://127.0.0.1:7341").expect_err("must reject");
    assert!(err.to_string().contains("ws or wss"));
    assert!(http_base("not a url").is_err());
}

#[test]
fn cli_parses_program_selection() {
    let cli = Cli::try_parse_from(["station-console", "program", "post"]).expect("parse");
    assert!(matches!(cli.command, Command::Program { program: Program::Post }));

    let cli = Cli::try_parse_from([
        "station-console",
        "--endpoint",
        "ws://hub:7341/ws",
        "server-status",
        "online",
    ])
    .expect("parse");
    assert_eq!(cli.endpoint.as_deref(), Some("ws://hub:7341/ws"));
    assert!(matches!(
        cli.command,
        Command::ServerStatus {
            status: ServerStatus::Online
        }
    ));
    assert!(Cli::try_parse_from(["station-console", "program", "bogus"]).is_err());
}
