use anyhow::Result;
use arena_server::error::GatewayError;
use arena_server::gateway::MoveRequest;
use ::common::{GAME_END, MATCH_FOUND, OPPONENT_DICE_ROLL, OPPONENT_MOVE, USER_DISCONNECTED};
use std::time::Duration;

mod common;
use self::common::{MockTokenValidator, TestClient, TestEnvironment};

fn validator() -> MockTokenValidator {
    MockTokenValidator::new()
        .with_token("jwt-alice", "5550001", "D1")
        .with_token("jwt-bob", "5550002", "D2")
        .with_token("jwt-carol", "5550003", "D3")
}

/// Connects alice and bob, queues them in league 3 and runs one pass
async fn matched_pair(env: &TestEnvironment) -> Result<(TestClient, TestClient, String)> {
    let mut alice = env.connect("sock-alice", "jwt-alice").await?;
    let mut bob = env.connect("sock-bob", "jwt-bob").await?;

    env.gateway.on_contest_join("sock-alice", "3", None).await?;
    env.gateway.on_contest_join("sock-bob", "3", None).await?;
    let results = env.engine.process_matchmaking().await;
    assert_eq!(results.len(), 1);
    let match_id = results[0].match_id.clone();

    let found = alice.expect_event(MATCH_FOUND).await?;
    assert_eq!(found.payload["opponent_user_id"], "5550002");
    assert_eq!(found.payload["turn_id"], 1);
    let found = bob.expect_event(MATCH_FOUND).await?;
    assert_eq!(found.payload["match_id"], match_id.as_str());
    assert_eq!(found.payload["turn_id"], 2);

    Ok((alice, bob, match_id))
}

fn request(game_id: &str, piece: &str, from: &str, to: &str) -> MoveRequest {
    MoveRequest {
        game_id: game_id.to_string(),
        piece_id: piece.to_string(),
        from_position: from.to_string(),
        to_position: to.to_string(),
        piece_type: "standard".to_string(),
        captured_piece: None,
    }
}

#[tokio::test]
async fn test_full_game_flow() -> Result<()> {
    timeout_test!(Duration::from_secs(10), async {
        let env = TestEnvironment::new(validator());
        let (mut alice, mut bob, game_id) = matched_pair(&env).await?;

        let buffered = env
            .gateway
            .on_piece_move(&alice.socket_id, request(&game_id, "piece_1", "initial", "6"))
            .await?;
        assert_eq!(buffered.total_moves, 1);
        let seen = bob.expect_event(OPPONENT_MOVE).await?;
        assert_eq!(seen.payload["user_id"], "5550001");
        assert_eq!(seen.payload["to_position"], "6");

        let roll = env.gateway.on_dice_roll(&bob.socket_id, &game_id).await?;
        assert!((1..=6).contains(&roll.value));
        let seen = alice.expect_event(OPPONENT_DICE_ROLL).await?;
        assert_eq!(seen.payload["value"], roll.value);

        let report = env.gateway.on_game_end(&game_id).await?;
        assert_eq!(report.flushed, 1);
        alice.expect_event(GAME_END).await?;
        bob.expect_event(GAME_END).await?;

        let history = env.gateway.move_buffer().piece_history(&game_id, alice.user_id()).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].last_position, "6");
        Ok::<_, anyhow::Error>(())
    })
}

#[tokio::test]
async fn test_outsider_cannot_move_in_a_match() -> Result<()> {
    let env = TestEnvironment::new(validator());
    let (_alice, _bob, game_id) = matched_pair(&env).await?;
    let carol = env.connect("sock-carol", "jwt-carol").await?;

    let result = env
        .gateway
        .on_piece_move(&carol.socket_id, request(&game_id, "piece_1", "initial", "3"))
        .await;
    assert!(matches!(result, Err(GatewayError::NotInMatch { .. })));

    let result = env.gateway.on_dice_roll(&carol.socket_id, "no-such-game").await;
    assert!(matches!(result, Err(GatewayError::Matchmaking(_))));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_notifies_fresh_opponent() -> Result<()> {
    let env = TestEnvironment::new(validator());
    let (alice, mut bob, game_id) = matched_pair(&env).await?;

    env.gateway.on_socket_disconnect(&alice.socket_id).await?;

    let notice = bob.expect_event(USER_DISCONNECTED).await?;
    assert_eq!(notice.payload["user_id"], "5550001");
    assert_eq!(notice.payload["match_id"], game_id.as_str());

    // Alice's session survives the disconnect
    assert!(env.sessions.get(&alice.session.session_token).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_unknown_socket_disconnect_is_harmless() -> Result<()> {
    let env = TestEnvironment::new(validator());
    assert_eq!(env.gateway.on_socket_disconnect("never-seen").await?, 0);
    Ok(())
}
