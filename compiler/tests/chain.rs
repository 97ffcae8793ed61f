use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use compiler::{Chain, ChainStatus, CompileOptions, ErrorCode, InMemoryReferences, Message, Value};
use pretty_assertions::assert_eq;

fn chain(source: &str) -> Chain {
    Chain::new(source, CompileOptions::new()).expect("parse failed")
}

#[tokio::test]
async fn documents_without_steps_complete_in_one_advance() {
    let mut chain = chain("<system>s</system><user>hi</user>");
    assert_eq!(chain.status(), ChainStatus::Idle);
    let out = chain.advance(None).await.expect("advance");
    assert!(out.is_complete);
    assert_eq!(out.pending_step_index, None);
    assert_eq!(out.conversation, vec![Message::system("s"), Message::user("hi")]);
    assert_eq!(chain.status(), ChainStatus::Completed);
    assert_eq!(chain.step_count(), 0);
}

#[tokio::test]
async fn each_step_pauses_once() {
    let src = "<step><user>one</user></step>\n<step><user>two</user><user>two-b</user></step>\n<step><user>three</user></step>";
    let mut chain = chain(src);

    let out = chain.advance(None).await.expect("step 0");
    assert_eq!(out.pending_step_index, Some(0));
    assert_eq!(out.conversation, vec![Message::user("one")]);
    assert_eq!(chain.status(), ChainStatus::Paused { step_index: 0 });

    let out = chain.advance(Some(vec![Message::assistant("r1")])).await.expect("step 1");
    assert_eq!(out.pending_step_index, Some(1));
    assert_eq!(
        out.conversation,
        vec![
            Message::user("one"),
            Message::assistant("r1"),
            Message::user("two"),
            Message::user("two-b"),
        ]
    );

    let out = chain.advance(Some(vec![Message::assistant("r2")])).await.expect("step 2");
    assert_eq!(out.pending_step_index, Some(2));

    let out = chain.advance(Some(vec![Message::assistant("r3")])).await.expect("finish");
    assert!(out.is_complete);
    assert_eq!(chain.step_count(), 3);
    // 4 produced messages across the steps plus 3 responses
    assert_eq!(out.conversation.len(), 7);
    assert_eq!(out.conversation.last(), Some(&Message::assistant("r3")));
}

#[tokio::test]
async fn empty_consecutive_steps_still_count() {
    let mut chain = chain("<step></step><step></step>");
    let out = chain.advance(None).await.expect("step 0");
    assert_eq!(out.pending_step_index, Some(0));
    assert!(out.conversation.is_empty());
    let out = chain.advance(Some(vec![Message::assistant("a")])).await.expect("step 1");
    assert_eq!(out.pending_step_index, Some(1));
    let out = chain.advance(Some(vec![Message::assistant("b")])).await.expect("finish");
    assert!(out.is_complete);
    assert_eq!(chain.step_count(), 2);
}

#[tokio::test]
async fn loose_text_before_a_step_is_part_of_it() {
    let mut chain = chain("Intro\n<step><user>Q</user></step>");
    let out = chain.advance(None).await.expect("step 0");
    assert_eq!(out.conversation, vec![Message::system("Intro"), Message::user("Q")]);
}

#[tokio::test]
async fn step_as_binds_the_response_text() {
    let src = "<step as=\"answer\"><user>Pick a number</user></step>\n<user>You said {{ answer }}</user>";
    let mut chain = chain(src);
    chain.advance(None).await.expect("step 0");
    let out = chain
        .advance(Some(vec![Message::assistant("forty-two")]))
        .await
        .expect("finish");
    assert!(out.is_complete);
    assert_eq!(out.conversation.last(), Some(&Message::user("You said forty-two")));
}

#[tokio::test]
async fn step_raw_binds_the_response_message() {
    let src = "<step raw=\"reply\"><user>Q</user></step>{{ reply.role }}:{{ reply.content[0].text }}";
    let mut chain = chain(src);
    chain.advance(None).await.expect("step 0");
    let out = chain.advance(Some(vec![Message::assistant("x")])).await.expect("finish");
    assert_eq!(
        out.conversation,
        vec![Message::user("Q"), Message::assistant("x"), Message::system("assistant:x")]
    );
}

#[tokio::test]
async fn functions_are_not_reinvoked_when_resuming() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tick = Value::function("tick", move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(args.first().cloned().unwrap_or_default())
    });
    let src = "{{ for i in [1, 2] }}<step><user>{{ tick(i) }}</user></step>{{ endfor }}<user>done</user>";
    let mut chain = Chain::new(src, CompileOptions::new().parameter("tick", tick)).expect("parse failed");

    let out = chain.advance(None).await.expect("step 0");
    assert_eq!(out.conversation, vec![Message::user("1")]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let out = chain.advance(Some(vec![Message::assistant("a")])).await.expect("step 1");
    assert_eq!(out.conversation.last(), Some(&Message::user("2")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let out = chain.advance(Some(vec![Message::assistant("b")])).await.expect("finish");
    assert!(out.is_complete);
    assert_eq!(out.conversation.last(), Some(&Message::user("done")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn references_are_fetched_once_across_steps() {
    let refs = Arc::new(InMemoryReferences::new().with("ask", "<user>question {{ n }}</user>"));
    let options = CompileOptions::new().reference_fn(refs.clone());
    let src = "{{ for i in [1, 2] }}<step><prompt path=\"ask\" n={{ i }} /></step>{{ endfor }}";
    let mut chain = Chain::new(src, options).expect("parse failed");

    chain.advance(None).await.expect("step 0");
    let out = chain.advance(Some(vec![Message::assistant("a")])).await.expect("step 1");
    assert_eq!(out.conversation.last(), Some(&Message::user("question 2")));
    chain.advance(Some(vec![Message::assistant("b")])).await.expect("finish");
    assert_eq!(refs.calls("ask"), 1);
}

#[tokio::test]
async fn steps_inside_references_pause_the_chain() {
    let refs = InMemoryReferences::new().with("child", "<step><user>from child</user></step>");
    let options = CompileOptions::new().reference_fn(Arc::new(refs));
    let mut chain = Chain::new("<prompt path=\"child\" /><user>after</user>", options).expect("parse failed");

    let out = chain.advance(None).await.expect("step 0");
    assert_eq!(out.conversation, vec![Message::user("from child")]);
    let out = chain.advance(Some(vec![Message::assistant("ok")])).await.expect("finish");
    assert!(out.is_complete);
    assert_eq!(out.conversation.last(), Some(&Message::user("after")));
}

#[tokio::test]
async fn steps_from_references_cannot_nest() {
    let refs = InMemoryReferences::new().with("child", "<step>x</step>");
    let options = CompileOptions::new().reference_fn(Arc::new(refs));
    let mut chain = Chain::new("<step><prompt path=\"child\" /></step>", options).expect("parse failed");
    let err = chain.advance(None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::StepTagInsideStep);
    assert_eq!(chain.status(), ChainStatus::Failed(ErrorCode::StepTagInsideStep));
}

#[tokio::test]
async fn protocol_misuse_does_not_change_state() {
    let mut chain = chain("<step><user>Q</user></step>");

    let err = chain.advance(Some(vec![Message::assistant("early")])).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidStepResponse);
    assert_eq!(chain.status(), ChainStatus::Idle);

    chain.advance(None).await.expect("step 0");
    let err = chain.advance(None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidStepResponse);
    let err = chain.advance(Some(Vec::new())).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidStepResponse);
    assert_eq!(chain.status(), ChainStatus::Paused { step_index: 0 });

    chain.advance(Some(vec![Message::assistant("A")])).await.expect("finish");
    let err = chain.advance(None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ChainCompleted);
    assert_eq!(chain.status(), ChainStatus::Completed);
}

#[tokio::test]
async fn failures_are_terminal() {
    let mut chain = chain("<step><user>Q</user></step>{{ missing }}");
    chain.advance(None).await.expect("step 0");
    let err = chain.advance(Some(vec![Message::assistant("A")])).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::VariableNotDeclared);
    assert_eq!(chain.status(), ChainStatus::Failed(ErrorCode::VariableNotDeclared));

    let err = chain.advance(None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ChainFailed);
}

#[tokio::test]
async fn abort_before_start() {
    let mut chain = chain("<user>hi</user>");
    chain.abort_handle().abort();
    let err = chain.advance(None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ChainAborted);
    assert_eq!(chain.status(), ChainStatus::Failed(ErrorCode::ChainAborted));
}

#[tokio::test]
async fn abort_while_paused() {
    let mut chain = chain("<step><user>Q</user></step><user>after</user>");
    let handle = chain.abort_handle();
    chain.advance(None).await.expect("step 0");
    handle.abort();
    let err = chain.advance(Some(vec![Message::assistant("A")])).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ChainAborted);
    let err = chain.advance(None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ChainFailed);
}

#[tokio::test]
async fn parse_errors_surface_from_new() {
    let err = Chain::new("<user>open", CompileOptions::new().full_path("main.promptl"))
        .err()
        .expect("expected a parse error");
    assert_eq!(err.code, ErrorCode::UnclosedTag);
    assert_eq!(err.source_path.as_deref(), Some("main.promptl"));
}

#[tokio::test]
async fn config_is_exposed_on_every_advance() {
    let mut chain = chain("---\nmodel: m\n---\n<step><user>Q</user></step>");
    let out = chain.advance(None).await.expect("step 0");
    assert_eq!(out.config, Some(serde_json::json!({ "model": "m" })));
    assert_eq!(chain.config(), Some(&serde_json::json!({ "model": "m" })));
}
