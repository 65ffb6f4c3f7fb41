//! Streaming generation tests
//!
//! Run whole sessions against the scripted engine and check what the lane
//! asked the engine to do.

mod common;

use common::{barrier, calls, generation_calls, script_with_fragments, session, session_with_config, Call};
use futures::StreamExt;
use mullama_bridge::config::DEFAULT_VISION_SYSTEM_PROMPT;
use mullama_bridge::streaming::utils::{collect_to_string, for_each_fragment};
use mullama_bridge::*;
use std::time::Duration;
use tokio::time::timeout;

async fn collect_fragments(stream: FragmentStream) -> Vec<Result<String>> {
    stream.collect().await
}

fn ok_fragments(items: Vec<Result<String>>) -> Vec<String> {
    items.into_iter().map(|item| item.unwrap()).collect()
}

#[cfg(test)]
mod text_tests {
    use super::*;

    #[tokio::test]
    async fn test_hello_streams_fragments_then_clears_cache() {
        let shared = script_with_fragments(&["He", "llo", "!"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let fragments = ok_fragments(collect_fragments(session.generate("Hello")).await);
        assert_eq!(fragments, vec!["He", "llo", "!"]);

        barrier(&session).await;
        assert_eq!(
            generation_calls(&shared),
            vec![
                Call::CompletionInit("Hello".to_string()),
                Call::CompletionStep(4),
                Call::CompletionStep(5),
                Call::CompletionStep(6),
                Call::CompletionStep(7),
                Call::ClearCache,
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_fragments_are_skipped() {
        let shared = script_with_fragments(&["a", "", "b"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let fragments = ok_fragments(collect_fragments(session.generate("x")).await);
        assert_eq!(fragments, vec!["a", "b"]);

        barrier(&session).await;
        let steps = generation_calls(&shared)
            .into_iter()
            .filter(|call| matches!(call, Call::CompletionStep(_)))
            .count();
        assert_eq!(steps, 4);
    }

    #[tokio::test]
    async fn test_max_steps_bounds_the_sequence() {
        let shared = script_with_fragments(&["a", "b", "c", "d", "e"]);
        let mut config = BridgeConfig::default();
        config.generation.max_steps = Some(2);
        let session = session_with_config(&shared, config);
        session.load("model.gguf").await.unwrap();

        let text = collect_to_string(session.generate("x")).await.unwrap();
        assert_eq!(text, "ab");

        barrier(&session).await;
        assert_eq!(
            generation_calls(&shared),
            vec![
                Call::CompletionInit("x".to_string()),
                Call::CompletionStep(4),
                Call::CompletionStep(5),
                Call::ClearCache,
            ]
        );
    }

    #[tokio::test]
    async fn test_context_length_bounds_the_sequence() {
        let shared = script_with_fragments(&["a", "b", "c", "d"]);
        shared.lock().unwrap().prompt_len = 2046;
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let text = collect_to_string(session.generate("long prompt")).await.unwrap();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn test_for_each_fragment_sees_every_fragment() {
        let shared = script_with_fragments(&["one ", "two ", "three"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let mut seen = Vec::new();
        for_each_fragment(session.generate("count"), |fragment| seen.push(fragment.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["one ", "two ", "three"]);
    }
}

#[cfg(test)]
mod vision_tests {
    use super::*;

    #[tokio::test]
    async fn test_vision_uses_default_prompt_and_keeps_cache() {
        let shared = script_with_fragments(&["He", "llo", "!"]);
        let session = session(&shared);
        session.load_vision_session().await.unwrap();
        session.load_image(vec![0xFF, 0xD8, 0xFF, 0xE0]).await.unwrap();

        let fragments = ok_fragments(collect_fragments(session.generate("Hello")).await);
        assert_eq!(fragments, vec!["He", "llo", "!"]);

        barrier(&session).await;
        let generation = generation_calls(&shared);
        assert_eq!(
            generation[0],
            Call::VisionCompletionInit {
                system: DEFAULT_VISION_SYSTEM_PROMPT.to_string(),
                user: "Hello\nASSISTANT:".to_string(),
            }
        );
        assert!(!generation.contains(&Call::ClearCache));
        assert_eq!(generation.len(), 5);
    }

    #[tokio::test]
    async fn test_image_placeholder_splits_prompt() {
        let shared = script_with_fragments(&["A cat."]);
        let session = session(&shared);
        session.load_vision_session().await.unwrap();
        session.load_image(b"jpeg".to_vec()).await.unwrap();

        collect_to_string(session.generate("SYSTEM\nUSER:<image>\nWhat is this?\nASSISTANT:"))
            .await
            .unwrap();

        assert_eq!(
            generation_calls(&shared)[0],
            Call::VisionCompletionInit {
                system: "SYSTEM\nUSER:".to_string(),
                user: "\nWhat is this?\nASSISTANT:".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_stop_marker_ends_vision_reply() {
        let shared = script_with_fragments(&["A cat", " sits", "###", "never"]);
        let session = session(&shared);
        session.load_vision_session().await.unwrap();
        session.load_image(b"jpeg".to_vec()).await.unwrap();

        let text = collect_to_string(session.generate("Describe")).await.unwrap();
        assert_eq!(text, "A cat sits");

        barrier(&session).await;
        assert!(!generation_calls(&shared).contains(&Call::VisionCompletionStep(7)));
    }

    #[tokio::test]
    async fn test_vision_without_image_is_not_ready() {
        let shared = script_with_fragments(&["x"]);
        let session = session(&shared);
        session.load_vision_session().await.unwrap();

        let result = collect_to_string(session.generate("Describe")).await;
        assert!(matches!(result, Err(BridgeError::NotReady(_))));
        assert!(generation_calls(&shared).is_empty());
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_while_idle_is_not_ready() {
        let shared = script_with_fragments(&["x"]);
        let session = session(&shared);

        let items = collect_fragments(session.generate("Hello")).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(BridgeError::NotReady(_))));
        assert!(generation_calls(&shared).is_empty());
    }

    #[tokio::test]
    async fn test_failed_init_yields_no_fragments() {
        let shared = script_with_fragments(&["a", "b"]);
        shared.lock().unwrap().fail_once.insert("completion_init");
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let items = collect_fragments(session.generate("x")).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(BridgeError::EngineFailure(_))));
        assert_eq!(session.status(), SessionStatus::Loaded);

        // the next turn starts from a clean cache
        let text = collect_to_string(session.generate("y")).await.unwrap();
        assert_eq!(text, "ab");
        let generation = generation_calls(&shared);
        assert_eq!(generation[1], Call::ClearCache);
        assert_eq!(generation[2], Call::CompletionInit("y".to_string()));
    }

    #[tokio::test]
    async fn test_step_failure_ends_stream_with_error() {
        let shared = script_with_fragments(&["a", "b", "c"]);
        shared.lock().unwrap().fail_step_at = Some(1);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let items = collect_fragments(session.generate("x")).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "a");
        assert!(matches!(items[1], Err(BridgeError::EngineFailure(_))));
        assert_eq!(session.status(), SessionStatus::Loaded);
    }

    #[tokio::test]
    async fn test_panicking_step_is_engine_failure_and_dirties_cache() {
        let shared = script_with_fragments(&["a"]);
        shared.lock().unwrap().panic_on.insert("completion_step");
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let items = collect_fragments(session.generate("x")).await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(BridgeError::EngineFailure(message)) => assert!(message.contains("panicked")),
            other => panic!("Expected EngineFailure, got {:?}", other),
        }

        shared.lock().unwrap().panic_on.clear();
        let text = collect_to_string(session.generate("y")).await.unwrap();
        assert_eq!(text, "a");
        barrier(&session).await;
        assert!(!session.is_generating());

        assert_eq!(
            generation_calls(&shared)[..4],
            [
                Call::CompletionInit("x".to_string()),
                Call::CompletionStep(4),
                Call::ClearCache,
                Call::CompletionInit("y".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_vision_init_is_engine_failure() {
        let shared = script_with_fragments(&["a"]);
        shared.lock().unwrap().panic_on.insert("vision_completion_init");
        let session = session(&shared);
        session.load_vision_session().await.unwrap();
        session.load_image(b"jpeg".to_vec()).await.unwrap();

        let result = collect_to_string(session.generate("Describe")).await;
        assert!(matches!(result, Err(BridgeError::EngineFailure(_))));
        assert_eq!(session.status(), SessionStatus::LoadedVision { has_image: true });
    }
}

#[cfg(test)]
mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_dropping_after_first_fragment_stops_stepping() {
        let shared = script_with_fragments(&["a", "b", "c"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let mut stream = session.generate("first");
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        drop(stream);

        barrier(&session).await;
        assert_eq!(
            generation_calls(&shared),
            vec![
                Call::CompletionInit("first".to_string()),
                Call::CompletionStep(4),
            ]
        );

        // the interrupted turn's cache is cleared before the next prompt
        let text = collect_to_string(session.generate("second")).await.unwrap();
        assert_eq!(text, "abc");
        let generation = generation_calls(&shared);
        assert_eq!(generation[2], Call::ClearCache);
        assert_eq!(generation[3], Call::CompletionInit("second".to_string()));
    }

    #[tokio::test]
    async fn test_unpolled_stream_never_starts() {
        let shared = script_with_fragments(&["a"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let stream = session.generate("never");
        drop(stream);

        barrier(&session).await;
        assert!(generation_calls(&shared).is_empty());
        assert!(!session.is_generating());
    }

    #[tokio::test]
    async fn test_held_stream_does_not_block_the_lane() {
        let shared = script_with_fragments(&["a"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let held = session.generate("later");
        let unloaded = timeout(Duration::from_secs(2), session.unload()).await;
        assert!(unloaded.expect("unload should not wait for an unpolled stream").is_ok());
        assert!(!session.is_generating());
        assert!(generation_calls(&shared).is_empty());

        let result = collect_to_string(held).await;
        assert!(matches!(result, Err(BridgeError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_second_stream_can_be_read_first() {
        let shared = script_with_fragments(&["He", "llo"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let first = session.generate("one");
        let second = session.generate("two");

        let text = timeout(Duration::from_secs(2), collect_to_string(second))
            .await
            .expect("second stream should not wait for the first");
        assert_eq!(text.unwrap(), "Hello");
        assert_eq!(collect_to_string(first).await.unwrap(), "Hello");

        let inits: Vec<Call> = generation_calls(&shared)
            .into_iter()
            .filter(|call| matches!(call, Call::CompletionInit(_)))
            .collect();
        assert_eq!(
            inits,
            vec![
                Call::CompletionInit("two".to_string()),
                Call::CompletionInit("one".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_generations_do_not_interleave() {
        let shared = script_with_fragments(&["He", "llo"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let first = session.generate("one");
        let second = session.generate("two");
        let (a, b) = tokio::join!(collect_to_string(first), collect_to_string(second));
        assert_eq!(a.unwrap(), "Hello");
        assert_eq!(b.unwrap(), "Hello");

        barrier(&session).await;
        let generation = generation_calls(&shared);
        let second_init = generation
            .iter()
            .position(|call| *call == Call::CompletionInit("two".to_string()))
            .unwrap();
        assert_eq!(generation[0], Call::CompletionInit("one".to_string()));
        assert_eq!(generation[second_init - 1], Call::ClearCache);
        assert!(generation[..second_init]
            .iter()
            .all(|call| *call != Call::CompletionInit("two".to_string())));
    }

    #[tokio::test]
    async fn test_is_generating_tracks_the_running_sequence() {
        let shared = script_with_fragments(&["a", "b"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();
        assert!(!session.is_generating());

        let mut stream = session.generate("x");
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(session.is_generating());

        while stream.next().await.is_some() {}
        barrier(&session).await;
        assert!(!session.is_generating());
    }

    #[tokio::test]
    async fn test_native_calls_stay_on_lane_thread() {
        let shared = script_with_fragments(&["a"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();
        collect_to_string(session.generate("x")).await.unwrap();

        let threads = shared.lock().unwrap().threads.clone();
        assert_eq!(threads.len(), 1);
        assert!(threads.contains("llm-runloop"));
        assert!(!calls(&shared).is_empty());
    }
}

#[cfg(test)]
mod conversation_tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_grows_assistant_message() {
        let shared = script_with_fragments(&["Hi", " there"]);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let mut conversation = Conversation::new();
        conversation.push_user_text("Hello");

        let mut updates = Vec::new();
        let reply = conversation
            .reply_with(&session, "Hello", |text| updates.push(text.to_string()))
            .await
            .unwrap();

        assert_eq!(reply, "Hi there");
        assert_eq!(updates, vec!["Hi", "Hi there"]);
        assert_eq!(conversation.messages().len(), 2);
        assert_eq!(conversation.messages()[1], ChatMessage::assistant("Hi there"));
    }

    #[tokio::test]
    async fn test_failed_reply_keeps_partial_text() {
        let shared = script_with_fragments(&["Hi", " there"]);
        shared.lock().unwrap().fail_step_at = Some(1);
        let session = session(&shared);
        session.load("model.gguf").await.unwrap();

        let mut conversation = Conversation::new();
        conversation.push_user_text("Hello");
        let result = conversation.reply(&session, "Hello").await;

        assert!(matches!(result, Err(BridgeError::EngineFailure(_))));
        assert_eq!(conversation.messages()[1].content, "Hi");
    }
}
