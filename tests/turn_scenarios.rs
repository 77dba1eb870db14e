//! 回合状态机集成测试（脚本化传输，无网络）

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, Notify};
    use tokio_util::sync::CancellationToken;

    use hive::core::{spawn_session, AgentError, Command, TurnOutcome};
    use hive::llm::mock::script;
    use hive::llm::{
        GeminiAdapter, OpenAiCompatAdapter, ProviderAdapter, RetryPolicy, ScriptedReply,
        ScriptedTransport, TransportError,
    };
    use hive::memory::{
        check_pairing, Conversation, Message, TokenBudget, ToolErrorKind, ToolInvocation,
        ToolResult,
    };
    use hive::react::{coalesce_text, run_turn, TurnContext, TurnEvent, TurnReport};
    use hive::subagents::{SubagentProfile, TaskRouter};
    use hive::tools::{
        Approval, AutoApprove, ConfirmationChannel, ConfirmationPolicy, EchoTool, Tool,
        ToolExecutor, ToolRegistry,
    };
    use hive::{AgentComponents, Session};

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }
    }

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools
    }

    fn components_with(
        adapter: Arc<dyn ProviderAdapter>,
        transport: Arc<ScriptedTransport>,
        tools: ToolRegistry,
        model: &str,
    ) -> AgentComponents {
        AgentComponents::new(
            adapter,
            transport,
            ToolExecutor::new(tools, 5),
            Arc::new(AutoApprove),
            model,
        )
        .with_retry(fast_retry(3))
    }

    fn openai_components(transport: Arc<ScriptedTransport>) -> AgentComponents {
        components_with(
            Arc::new(OpenAiCompatAdapter::new()),
            transport,
            registry(),
            "gpt-4o-mini",
        )
    }

    /// 运行一个回合并收集实时事件
    async fn run(
        components: &AgentComponents,
        conversation: &mut Conversation,
        input: &str,
    ) -> (TurnReport, Vec<TurnEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TurnContext::new(components, CancellationToken::new()).with_event_tx(&tx);
        let mut approvals = ConfirmationPolicy::default();
        let report = run_turn(&ctx, conversation, &mut approvals, input).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (report, events)
    }

    fn tool_results(conversation: &Conversation) -> Vec<&ToolResult> {
        conversation
            .messages()
            .iter()
            .filter_map(|m| m.result())
            .collect()
    }

    #[tokio::test]
    async fn test_routing_notice_precedes_model_call() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Chunks(
            script::openai_text(&["Found ", "two issues."]),
        )]));
        let components = openai_components(transport.clone())
            .with_router(TaskRouter::with_builtin().unwrap());
        let mut conversation = Conversation::new();

        let (report, events) =
            run(&components, &mut conversation, "review this code for security issues").await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.profile.as_deref(), Some("code-reviewer"));
        assert!(matches!(&events[0], TurnEvent::TurnStarted { .. }));
        assert!(matches!(
            &events[1],
            TurnEvent::DelegationNotice { profile, .. } if profile == "code-reviewer"
        ));
        let first_text = events
            .iter()
            .position(|e| matches!(e, TurnEvent::TextDelta { .. }))
            .unwrap();
        assert!(first_text > 1);

        // 选中的 profile 指令替换默认系统提示词
        let request = &transport.requests()[0];
        let system = request.body["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("senior code reviewer"));
        assert_eq!(report.final_text, "Found two issues.");
    }

    #[tokio::test]
    async fn test_no_routing_without_match() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Chunks(
            script::openai_text(&["Sunny."]),
        )]));
        let components = openai_components(transport.clone())
            .with_router(TaskRouter::with_builtin().unwrap())
            .with_system_prompt("default prompt");
        let mut conversation = Conversation::new();

        let (report, events) = run(&components, &mut conversation, "what's the weather").await;

        assert!(report.profile.is_none());
        assert!(!events
            .iter()
            .any(|e| matches!(e, TurnEvent::DelegationNotice { .. })));
        assert_eq!(
            transport.requests()[0].body["messages"][0]["content"],
            "default prompt"
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back_and_loop_continues() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(script::openai_tool_calls(&[("c1", "nope", json!({}))])),
            ScriptedReply::Chunks(script::openai_text(&["Sorry, that tool does not exist."])),
        ]));
        let components = openai_components(transport.clone());
        let mut conversation = Conversation::new();

        let (report, _) = run(&components, &mut conversation, "use nope").await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(report.steps, 2);
        let results = tool_results(&conversation);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind, Some(ToolErrorKind::UnknownTool));

        // 第二次请求带上了错误结果
        let second = &transport.requests()[1];
        let messages = second.body["messages"].as_array().unwrap();
        let tool_message = messages.iter().find(|m| m["role"] == "tool").unwrap();
        assert_eq!(tool_message["tool_call_id"], "c1");
        assert!(tool_message["content"]
            .as_str()
            .unwrap()
            .contains("unknown_tool"));
    }

    #[tokio::test]
    async fn test_results_follow_invocation_order() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(script::gemini_tool_calls(&[
                ("g1", "echo", json!({"text": "first"})),
                ("g2", "echo", json!({"text": "second"})),
                ("g3", "echo", json!({"text": "third"})),
            ])),
            ScriptedReply::Chunks(script::gemini_text(&["All ", "done."])),
        ]));
        let components = components_with(
            Arc::new(GeminiAdapter::new()),
            transport.clone(),
            registry(),
            "gemini-2.0-flash",
        );
        let mut conversation = Conversation::new();

        let (report, events) = run(&components, &mut conversation, "echo three things").await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(check_pairing(conversation.messages()), Ok(()));
        let ids: Vec<&str> = tool_results(&conversation)
            .iter()
            .map(|r| r.invocation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["g1", "g2", "g3"]);
        let payloads: Vec<Value> = tool_results(&conversation)
            .iter()
            .map(|r| r.payload.clone())
            .collect();
        assert_eq!(payloads, vec![json!("first"), json!("second"), json!("third")]);

        // 结果以 functionResponse 回传
        let second = &transport.requests()[1];
        let contents = second.body["contents"].as_array().unwrap();
        let last = contents.last().unwrap();
        assert_eq!(last["role"], "user");
        assert_eq!(last["parts"].as_array().unwrap().len(), 3);
        assert_eq!(last["parts"][0]["functionResponse"]["name"], "echo");

        // 实时事件与重建事件一致（文本增量合并后）
        assert_eq!(coalesce_text(&events), report.replay(&conversation));
    }

    #[tokio::test]
    async fn test_inline_marker_invocations_are_executed() {
        let content = "Let me echo.<|tool_calls_section_begin|><|tool_call_begin|>functions.echo:0<|tool_call_argument_begin|>{\"text\": \"marker\"}<|tool_call_end|><|tool_calls_section_end|>";
        let (head, tail) = content.split_at(25);
        let first = vec![
            json!({"choices": [{"index": 0, "delta": {"content": head}}]}).to_string(),
            json!({"choices": [{"index": 0, "delta": {"content": tail}}]}).to_string(),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})
                .to_string(),
            "[DONE]".to_string(),
        ];
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(first),
            ScriptedReply::Chunks(script::openai_text(&["Echoed."])),
        ]));
        let components = openai_components(transport.clone());
        let mut conversation = Conversation::new();

        let (report, events) = run(&components, &mut conversation, "echo via markers").await;

        assert_eq!(report.outcome, TurnOutcome::Completed);
        let results = tool_results(&conversation);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].payload, json!("marker"));
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(streamed.starts_with("Let me echo."));
        assert!(!streamed.contains("<|"));
    }

    #[tokio::test]
    async fn test_compression_drops_oldest_exchanges() {
        let mut conversation = Conversation::new();
        for i in 0..10 {
            conversation.push(Message::user(format!(
                "question {i}: {}",
                "lorem ipsum dolor ".repeat(12)
            )));
            conversation.push(Message::assistant_with_invocations(
                "",
                vec![ToolInvocation::new(
                    format!("call_{i}"),
                    "echo",
                    json!({"text": format!("value {i}")}),
                )],
            ));
            conversation.push(Message::tool(ToolResult::ok(
                format!("call_{i}"),
                json!(format!("value {i}")),
            )));
            conversation.push(Message::assistant(format!("answer {i}")));
        }
        let before = conversation.len();

        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Chunks(
            script::openai_text(&["ok"]),
        )]));
        let components =
            openai_components(transport.clone()).with_budget(TokenBudget::new(300));

        let (report, _) = run(&components, &mut conversation, "latest question").await;
        assert_eq!(report.outcome, TurnOutcome::Completed);

        // 对话本身只追加，压缩只作用于发出的副本
        assert_eq!(conversation.len(), before + 2);

        let request = &transport.requests()[0];
        let sent = request.body["messages"].as_array().unwrap();
        // system + 保留的消息，远少于完整历史
        assert!(sent.len() < before);
        let last_user = sent.iter().rev().find(|m| m["role"] == "user").unwrap();
        assert_eq!(last_user["content"], "latest question");
        // 保留部分从一个完整交换开始
        assert_eq!(sent[1]["role"], "user");
        let first_kept = sent[1]["content"].as_str().unwrap();
        assert!(!first_kept.starts_with("question 0:"));

        // 每个 tool 消息都能在前面的 assistant 中找到对应调用
        let mut open_calls: Vec<String> = Vec::new();
        for message in sent {
            if let Some(calls) = message["tool_calls"].as_array() {
                open_calls = calls
                    .iter()
                    .map(|c| c["id"].as_str().unwrap().to_string())
                    .collect();
            }
            if message["role"] == "tool" {
                let id = message["tool_call_id"].as_str().unwrap();
                assert!(open_calls.iter().any(|c| c == id), "orphan result {id}");
            }
        }
    }

    #[tokio::test]
    async fn test_budget_exceeded_terminates_without_model_call() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let components = openai_components(transport.clone()).with_budget(TokenBudget::new(10));
        let mut conversation = Conversation::new();

        let (report, events) =
            run(&components, &mut conversation, &"very long request ".repeat(40)).await;

        assert!(matches!(
            report.outcome,
            TurnOutcome::Failed(AgentError::BudgetExceeded { .. })
        ));
        assert_eq!(transport.request_count(), 0);
        assert_eq!(conversation.len(), 1);
        assert!(matches!(
            events.last(),
            Some(TurnEvent::TurnError { kind, .. }) if kind == "budget_exceeded"
        ));
    }

    /// 执行时通知测试方，然后一直挂起
    struct Blocking {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Tool for Blocking {
        fn name(&self) -> &str {
            "block"
        }

        fn description(&self) -> &str {
            "Blocks until cancelled"
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_cancel_during_tool_skips_remaining() {
        let started = Arc::new(Notify::new());
        let mut tools = registry();
        tools.register(Blocking {
            started: started.clone(),
        });
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Chunks(
            script::openai_tool_calls(&[
                ("c1", "block", json!({})),
                ("c2", "echo", json!({"text": "never"})),
            ]),
        )]));
        let components = components_with(
            Arc::new(OpenAiCompatAdapter::new()),
            transport.clone(),
            tools,
            "gpt-4o-mini",
        );

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TurnContext::new(&components, token.clone()).with_event_tx(&tx);
        let mut conversation = Conversation::new();
        let mut approvals = ConfirmationPolicy::default();

        let canceller = async {
            started.notified().await;
            token.cancel();
        };
        let (report, _) = tokio::join!(
            run_turn(&ctx, &mut conversation, &mut approvals, "block then echo"),
            canceller
        );

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(check_pairing(conversation.messages()), Ok(()));
        let results = tool_results(&conversation);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_skipped()));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&TurnEvent::TurnCancelled));
        let started_tools = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolStarted { .. }))
            .count();
        assert_eq!(started_tools, 1);
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_cancel_during_stream_appends_nothing() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Hang(vec![
            json!({"choices": [{"index": 0, "delta": {"content": "partial"}}]}).to_string(),
        ])]));
        let components = openai_components(transport.clone());
        let token = CancellationToken::new();
        let ctx = TurnContext::new(&components, token.clone());
        let mut conversation = Conversation::new();
        let mut approvals = ConfirmationPolicy::default();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        };
        let (report, _) = tokio::join!(
            run_turn(&ctx, &mut conversation, &mut approvals, "hello"),
            canceller
        );

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        // 只有用户消息，没有半截的 assistant 消息
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation.messages()[0], Message::user("hello"));
    }

    #[tokio::test]
    async fn test_step_limit_forces_done_with_notice() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(script::openai_tool_calls(&[("c1", "echo", json!({"text": "1"}))])),
            ScriptedReply::Chunks(script::openai_tool_calls(&[("c2", "echo", json!({"text": "2"}))])),
            ScriptedReply::Chunks(script::openai_text(&["never reached"])),
        ]));
        let components = openai_components(transport.clone()).with_max_steps(2);
        let mut conversation = Conversation::new();

        let (report, events) = run(&components, &mut conversation, "loop forever").await;

        assert_eq!(report.outcome, TurnOutcome::StepLimitReached { steps: 2 });
        assert_eq!(transport.request_count(), 2);
        assert_eq!(check_pairing(conversation.messages()), Ok(()));
        match events.last() {
            Some(TurnEvent::TurnDone { notice: Some(notice), .. }) => {
                assert!(notice.contains("step limit"))
            }
            other => panic!("Expected turn_done with notice, got {other:?}"),
        }
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_fatal_provider_error_preserves_conversation() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Fail(
            TransportError::Status {
                status: 401,
                body: r#"{"error": {"message": "Incorrect API key provided", "code": "invalid_api_key"}}"#.into(),
                retry_after: None,
            },
        )]));
        let components = openai_components(transport.clone());
        let mut conversation = Conversation::new();
        conversation.push(Message::user("earlier"));
        conversation.push(Message::assistant("earlier answer"));

        let (report, events) = run(&components, &mut conversation, "hi").await;

        assert!(matches!(
            report.outcome,
            TurnOutcome::Failed(AgentError::ProviderFatal(_))
        ));
        assert_eq!(transport.request_count(), 1);
        assert_eq!(conversation.len(), 3);
        assert!(matches!(
            events.last(),
            Some(TurnEvent::TurnError { kind, .. }) if kind == "provider_fatal_error"
        ));
    }

    #[tokio::test]
    async fn test_mid_stream_error_escalates_to_fatal() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::ChunksThenFail(
            vec![json!({"choices": [{"index": 0, "delta": {"content": "half"}}]}).to_string()],
            TransportError::Network("connection reset".into()),
        )]));
        let components = openai_components(transport.clone());
        let mut conversation = Conversation::new();

        let (report, _) = run(&components, &mut conversation, "hi").await;

        match &report.outcome {
            TurnOutcome::Failed(AgentError::ProviderFatal(message)) => {
                assert!(message.contains("stream interrupted"), "{message}");
                assert!(message.contains("connection reset"), "{message}");
            }
            other => panic!("Expected provider_fatal_error, got {other:?}"),
        }
        // 已输出部分文本，不再重发请求
        assert_eq!(transport.request_count(), 1);
        assert_eq!(conversation.len(), 1);
    }

    #[tokio::test]
    async fn test_usage_is_accumulated() {
        let mut first = script::openai_tool_calls(&[("c1", "echo", json!({"text": "x"}))]);
        first.insert(
            first.len() - 1,
            json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12}})
                .to_string(),
        );
        let mut second = script::openai_text(&["done"]);
        second.insert(
            second.len() - 1,
            json!({"choices": [], "usage": {"prompt_tokens": 20, "completion_tokens": 3, "total_tokens": 23}})
                .to_string(),
        );
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(first),
            ScriptedReply::Chunks(second),
        ]));
        let components = openai_components(transport);
        let mut conversation = Conversation::new();

        let (report, _) = run(&components, &mut conversation, "count tokens").await;

        assert_eq!(report.usage.prompt_tokens, 30);
        assert_eq!(report.usage.total_tokens, 35);
    }

    /// 需确认的工具
    struct Write;

    #[async_trait]
    impl Tool for Write {
        fn name(&self) -> &str {
            "write"
        }

        fn description(&self) -> &str {
            "Writes something"
        }

        fn requires_confirmation(&self) -> bool {
            true
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            Ok(json!("written"))
        }
    }

    struct Recording {
        asked: AtomicUsize,
        answer: Approval,
    }

    #[async_trait]
    impl ConfirmationChannel for Recording {
        async fn request_approval(&self, _invocation: &ToolInvocation) -> Approval {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    #[tokio::test]
    async fn test_approved_always_is_remembered_for_session() {
        let mut tools = registry();
        tools.register(Write);
        let channel = Arc::new(Recording {
            asked: AtomicUsize::new(0),
            answer: Approval::ApprovedAlways,
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(script::openai_tool_calls(&[
                ("w1", "write", json!({})),
                ("w2", "write", json!({})),
            ])),
            ScriptedReply::Chunks(script::openai_text(&["ok"])),
        ]));
        let components = AgentComponents::new(
            Arc::new(OpenAiCompatAdapter::new()),
            transport,
            ToolExecutor::new(tools, 5),
            channel.clone(),
            "gpt-4o-mini",
        );
        let mut session = Session::new(Arc::new(components));

        let text = session.process_message("write twice").await.unwrap();

        assert_eq!(text, "ok");
        assert_eq!(channel.asked.load(Ordering::SeqCst), 1);
        let results = tool_results(session.conversation());
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_rejection_becomes_tool_result() {
        let mut tools = registry();
        tools.register(Write);
        let channel = Arc::new(Recording {
            asked: AtomicUsize::new(0),
            answer: Approval::Rejected,
        });
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(script::openai_tool_calls(&[("w1", "write", json!({}))])),
            ScriptedReply::Chunks(script::openai_text(&["Understood."])),
        ]));
        let components = AgentComponents::new(
            Arc::new(OpenAiCompatAdapter::new()),
            transport,
            ToolExecutor::new(tools, 5),
            channel,
            "gpt-4o-mini",
        );
        let mut session = Session::new(Arc::new(components));

        let text = session.process_message("write").await.unwrap();

        assert_eq!(text, "Understood.");
        let results = tool_results(session.conversation());
        assert_eq!(results[0].error_kind, Some(ToolErrorKind::UserRejected));
    }

    async fn next_terminal(rx: &mut mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_session_commands() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ScriptedReply::Chunks(script::openai_text(&["first answer"])),
            ScriptedReply::Hang(vec![]),
            ScriptedReply::Chunks(script::openai_text(&["after cancel"])),
        ]));
        let components = openai_components(transport);
        let (cmd_tx, mut event_rx, handle) = spawn_session(Session::new(Arc::new(components)));

        cmd_tx.send(Command::Submit("one".into())).unwrap();
        let events = next_terminal(&mut event_rx).await;
        assert!(matches!(
            events.last(),
            Some(TurnEvent::TurnDone { final_text, .. }) if final_text == "first answer"
        ));

        // 回合进行中 Cancel 立即生效
        cmd_tx.send(Command::Submit("two".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cmd_tx.send(Command::Cancel).unwrap();
        let events = next_terminal(&mut event_rx).await;
        assert_eq!(events.last(), Some(&TurnEvent::TurnCancelled));

        cmd_tx.send(Command::Submit("three".into())).unwrap();
        let events = next_terminal(&mut event_rx).await;
        assert!(matches!(events.last(), Some(TurnEvent::TurnDone { .. })));

        cmd_tx.send(Command::Clear).unwrap();
        cmd_tx.send(Command::Quit).unwrap();
        let session = handle.await.unwrap();
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_immediately_after_submit() {
        for _ in 0..20 {
            let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Hang(vec![])]));
            let components = openai_components(transport);
            let (cmd_tx, mut event_rx, handle) =
                spawn_session(Session::new(Arc::new(components)));

            cmd_tx.send(Command::Submit("hi".into())).unwrap();
            cmd_tx.send(Command::Cancel).unwrap();
            let events = tokio::time::timeout(Duration::from_secs(2), next_terminal(&mut event_rx))
                .await
                .expect("cancel was not applied to the submitted turn");
            assert_eq!(events.last(), Some(&TurnEvent::TurnCancelled));

            cmd_tx.send(Command::Quit).unwrap();
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_profile_instruction_counts_against_budget() {
        let checklist = "Follow the release checklist step by step. ".repeat(80);
        let router = TaskRouter::new(vec![SubagentProfile::new(
            "release-manager",
            "Release planning",
            &[r"plan.*release"],
            checklist,
        )])
        .unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Chunks(
            script::openai_text(&["hello"]),
        )]));
        let components = openai_components(transport.clone())
            .with_router(router)
            .with_budget(TokenBudget::new(600));

        // 只看消息时远低于上限，加上 profile 指令后超限
        let mut conversation = Conversation::new();
        let (report, _) = run(&components, &mut conversation, "plan the next release").await;
        match report.outcome {
            TurnOutcome::Failed(AgentError::BudgetExceeded { estimate, ceiling }) => {
                assert_eq!(ceiling, 600);
                assert!(estimate > 600);
            }
            other => panic!("Expected budget_exceeded, got {other:?}"),
        }
        assert_eq!(transport.request_count(), 0);

        // 默认指令下同样的上限足够
        let mut conversation = Conversation::new();
        let (report, _) = run(&components, &mut conversation, "say hello").await;
        assert_eq!(report.outcome, TurnOutcome::Completed);
        assert_eq!(transport.request_count(), 1);
    }

    /// 询问确认时通知测试方，然后一直等待
    struct PendingApproval {
        asked: Arc<Notify>,
    }

    #[async_trait]
    impl ConfirmationChannel for PendingApproval {
        async fn request_approval(&self, _invocation: &ToolInvocation) -> Approval {
            self.asked.notify_one();
            std::future::pending::<()>().await;
            Approval::Approved
        }
    }

    /// 需确认的工具，记录实际执行次数
    struct CountingWrite {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingWrite {
        fn name(&self) -> &str {
            "write"
        }

        fn description(&self) -> &str {
            "Writes something"
        }

        fn requires_confirmation(&self) -> bool {
            true
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!("written"))
        }
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_confirmation() {
        let asked = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut tools = registry();
        tools.register(CountingWrite { runs: runs.clone() });
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::Chunks(
            script::openai_tool_calls(&[
                ("w1", "write", json!({})),
                ("e2", "echo", json!({"text": "after"})),
            ]),
        )]));
        let components = AgentComponents::new(
            Arc::new(OpenAiCompatAdapter::new()),
            transport.clone(),
            ToolExecutor::new(tools, 5),
            Arc::new(PendingApproval {
                asked: asked.clone(),
            }),
            "gpt-4o-mini",
        );

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TurnContext::new(&components, token.clone()).with_event_tx(&tx);
        let mut conversation = Conversation::new();
        let mut approvals = ConfirmationPolicy::default();

        let canceller = async {
            asked.notified().await;
            token.cancel();
        };
        let (report, _) = tokio::join!(
            run_turn(&ctx, &mut conversation, &mut approvals, "write then echo"),
            canceller
        );

        assert_eq!(report.outcome, TurnOutcome::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(check_pairing(conversation.messages()), Ok(()));
        let results = tool_results(&conversation);
        let ids: Vec<&str> = results.iter().map(|r| r.invocation_id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "e2"]);
        assert!(results.iter().all(|r| r.is_skipped()));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.last(), Some(&TurnEvent::TurnCancelled));
    }
}
