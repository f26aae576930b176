//! Dice Race
//!
//! A small push-your-luck dice game used as the hosted application in the
//! binary and in tests. Players take turns rolling: a 1 loses the turn's
//! total, holding banks it. First to the target score wins. A turn that
//! runs out of time is forfeited.

use crate::app::{AppError, Application, Context, MethodCall, MethodError, Response};
use crate::core::codec::{decode_from_slice, encode_to_vec, Decode, Encode, Reader, Writer, CodecResult};
use crate::core::ids::UserId;

/// Score needed to win when the creator does not choose one.
pub const DEFAULT_TARGET: u32 = 50;

/// Seconds a player has to act before the turn is forfeited.
pub const TURN_SECONDS: f32 = 30.0;

/// Method tags.
pub mod tags {
    /// Join the game.
    pub const JOIN: u8 = 0;
    /// Roll the die.
    pub const ROLL: u8 = 1;
    /// Bank the turn total.
    pub const HOLD: u8 = 2;
    /// Change the target score (host, before the first roll).
    pub const SET_TARGET: u8 = 3;
}

// =============================================================================
// STATE
// =============================================================================

/// One seated player.
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    /// Player identity.
    pub id: UserId,
    /// Banked score.
    pub score: u32,
}

/// Authoritative game state.
#[derive(Debug, Clone, PartialEq)]
pub struct DiceState {
    /// Session creator; the only player allowed to change the target.
    pub host: UserId,
    /// Seated players in turn order.
    pub players: Vec<Player>,
    /// Index of the player to act.
    pub turn: usize,
    /// Points accumulated this turn, lost on a 1.
    pub turn_total: u32,
    /// Seconds left for the current turn.
    pub turn_time_left: f32,
    /// Most recent roll.
    pub last_roll: Option<u8>,
    /// Score needed to win.
    pub target: u32,
    /// Total rolls so far.
    pub rolls: u32,
    /// Winner, once decided.
    pub winner: Option<UserId>,
    /// Creation time (journaled, ms since epoch).
    pub started_at: u64,
}

impl DiceState {
    fn current_player(&self) -> Option<&Player> {
        self.players.get(self.turn)
    }

    fn is_turn_of(&self, user: &UserId) -> bool {
        self.current_player().map(|p| &p.id == user).unwrap_or(false)
    }

    fn advance_turn(&mut self) {
        self.turn_total = 0;
        self.turn_time_left = TURN_SECONDS;
        if !self.players.is_empty() {
            self.turn = (self.turn + 1) % self.players.len();
        }
    }

    fn check_can_act(&self, user: &UserId) -> Result<(), Response> {
        if self.winner.is_some() {
            return Err(Response::error("game is over"));
        }
        if !self.is_turn_of(user) {
            return Err(Response::error("not your turn"));
        }
        Ok(())
    }
}

// =============================================================================
// METHODS
// =============================================================================

/// Initialization arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiceConfig {
    /// Target score; 0 picks [`DEFAULT_TARGET`].
    pub target: u32,
}

impl Encode for DiceConfig {
    fn encode(&self, writer: &mut Writer) {
        self.target.encode(writer);
    }
}

impl Decode for DiceConfig {
    fn decode(reader: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            target: u32::decode(reader)?,
        })
    }
}

/// Every method the dice game accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiceMethod {
    /// Take a seat.
    Join,
    /// Roll the die.
    Roll,
    /// Bank the turn total and pass.
    Hold,
    /// Change the target score.
    SetTarget {
        /// New target.
        target: u32,
    },
}

impl DiceMethod {
    /// Tag and tracked argument bytes, as a client would send them.
    pub fn to_call(&self) -> (u8, Vec<u8>) {
        match self {
            Self::Join => (tags::JOIN, Writer::new().finish()),
            Self::Roll => (tags::ROLL, Writer::new().finish()),
            Self::Hold => (tags::HOLD, Writer::new().finish()),
            Self::SetTarget { target } => (tags::SET_TARGET, encode_to_vec(target)),
        }
    }
}

impl MethodCall for DiceMethod {
    fn decode(tag: u8, args: &[u8]) -> Result<Self, MethodError> {
        match tag {
            tags::JOIN => Ok(Self::Join),
            tags::ROLL => Ok(Self::Roll),
            tags::HOLD => Ok(Self::Hold),
            tags::SET_TARGET => Ok(Self::SetTarget {
                target: decode_from_slice(args)?,
            }),
            other => Err(MethodError::UnknownMethod(other)),
        }
    }
}

// =============================================================================
// USER VIEW
// =============================================================================

crate::sync_object! {
    /// One row of the scoreboard.
    #[derive(Default)]
    pub struct PlayerView => PlayerViewDiff {
        /// Player identity.
        pub id: String,
        /// Banked score.
        pub score: u32,
        /// Whether this row is the viewer.
        pub is_you: bool,
    }
}

crate::sync_object! {
    /// What one player sees.
    #[derive(Default)]
    pub struct DiceView => DiceViewDiff {
        /// Scoreboard in turn order.
        pub players: Vec<PlayerView>,
        /// Player to act.
        pub current_turn: Option<String>,
        /// Whether the viewer is to act.
        pub your_turn: bool,
        /// Points at risk this turn.
        pub turn_total: u32,
        /// Whole seconds left in the turn.
        pub turn_seconds_left: u32,
        /// Most recent roll.
        pub last_roll: Option<u8>,
        /// Score needed to win.
        pub target: u32,
        /// Winner, once decided.
        pub winner: Option<String>,
        /// Creation time (ms since epoch).
        pub started_at: u64,
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

/// The dice race rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceGame;

impl Application for DiceGame {
    type State = DiceState;
    type Method = DiceMethod;
    type UserView = DiceView;

    fn initialize(
        &self,
        ctx: &mut Context<'_>,
        user: &UserId,
        args: &[u8],
    ) -> Result<DiceState, AppError> {
        let config: DiceConfig = if args.is_empty() {
            DiceConfig::default()
        } else {
            decode_from_slice(args)?
        };
        let target = if config.target == 0 {
            DEFAULT_TARGET
        } else {
            config.target
        };

        Ok(DiceState {
            host: user.clone(),
            players: vec![Player {
                id: user.clone(),
                score: 0,
            }],
            turn: 0,
            turn_total: 0,
            turn_time_left: TURN_SECONDS,
            last_roll: None,
            target,
            rolls: 0,
            winner: None,
            started_at: ctx.time(),
        })
    }

    fn apply(
        &self,
        state: &mut DiceState,
        ctx: &mut Context<'_>,
        user: &UserId,
        method: DiceMethod,
    ) -> Response {
        match method {
            DiceMethod::Join => {
                if state.winner.is_some() {
                    return Response::error("game is over");
                }
                if state.players.iter().any(|p| &p.id == user) {
                    return Response::error("already joined");
                }
                state.players.push(Player {
                    id: user.clone(),
                    score: 0,
                });
                Response::Ok
            }
            DiceMethod::Roll => {
                if let Err(rejection) = state.check_can_act(user) {
                    return rejection;
                }
                let roll = ctx.rng().next_int_range(1, 6) as u8;
                state.rolls += 1;
                state.last_roll = Some(roll);
                if roll == 1 {
                    state.advance_turn();
                } else {
                    state.turn_total += roll as u32;
                }
                Response::Ok
            }
            DiceMethod::Hold => {
                if let Err(rejection) = state.check_can_act(user) {
                    return rejection;
                }
                let banked = state.turn_total;
                let turn = state.turn;
                let player = &mut state.players[turn];
                player.score += banked;
                if player.score >= state.target {
                    state.winner = Some(player.id.clone());
                    state.turn_total = 0;
                } else {
                    state.advance_turn();
                }
                Response::Ok
            }
            DiceMethod::SetTarget { target } => {
                if user != &state.host {
                    return Response::error("only the host can change the target");
                }
                if state.rolls > 0 {
                    return Response::error("game already started");
                }
                if target == 0 {
                    return Response::error("target must be positive");
                }
                state.target = target;
                Response::Ok
            }
        }
    }

    fn on_tick(&self, state: &mut DiceState, _ctx: &mut Context<'_>, elapsed_secs: f32) {
        if state.winner.is_some() || state.players.len() < 2 {
            return;
        }
        state.turn_time_left -= elapsed_secs;
        if state.turn_time_left <= 0.0 {
            state.advance_turn();
        }
    }

    fn project(&self, state: &DiceState, user: &UserId) -> DiceView {
        DiceView {
            players: state
                .players
                .iter()
                .map(|p| PlayerView {
                    id: p.id.to_string(),
                    score: p.score,
                    is_you: &p.id == user,
                })
                .collect(),
            current_turn: if state.winner.is_none() {
                state.current_player().map(|p| p.id.to_string())
            } else {
                None
            },
            your_turn: state.winner.is_none() && state.is_turn_of(user),
            turn_total: state.turn_total,
            turn_seconds_left: state.turn_time_left.max(0.0).ceil() as u32,
            last_roll: state.last_roll,
            target: state.target,
            winner: state.winner.as_ref().map(|w| w.to_string()),
            started_at: state.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;

    fn new_game(rng: &mut DeterministicRng) -> DiceState {
        let mut ctx = Context::new(rng, 1_000);
        DiceGame
            .initialize(&mut ctx, &UserId::from("alice"), &[])
            .unwrap()
    }

    fn call(state: &mut DiceState, rng: &mut DeterministicRng, user: &str, method: DiceMethod) -> Response {
        let mut ctx = Context::new(rng, 2_000);
        DiceGame.apply(state, &mut ctx, &UserId::from(user), method)
    }

    #[test]
    fn test_initialize_seats_creator() {
        let mut rng = DeterministicRng::new(1);
        let state = new_game(&mut rng);
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.host, UserId::from("alice"));
        assert_eq!(state.target, DEFAULT_TARGET);
        assert_eq!(state.started_at, 1_000);
    }

    #[test]
    fn test_initialize_with_config() {
        let mut rng = DeterministicRng::new(1);
        let mut ctx = Context::new(&mut rng, 0);
        let args = encode_to_vec(&DiceConfig { target: 12 });
        let state = DiceGame
            .initialize(&mut ctx, &UserId::from("alice"), &args)
            .unwrap();
        assert_eq!(state.target, 12);

        let bad = DiceGame.initialize(&mut ctx, &UserId::from("alice"), &[0x05]);
        assert!(matches!(bad, Err(AppError::Malformed(_))));
    }

    #[test]
    fn test_turn_enforcement() {
        let mut rng = DeterministicRng::new(2);
        let mut state = new_game(&mut rng);
        assert!(call(&mut state, &mut rng, "bob", DiceMethod::Join).is_ok());
        assert_eq!(
            call(&mut state, &mut rng, "bob", DiceMethod::Roll),
            Response::error("not your turn")
        );
        assert_eq!(
            call(&mut state, &mut rng, "bob", DiceMethod::Join),
            Response::error("already joined")
        );
        assert!(call(&mut state, &mut rng, "alice", DiceMethod::Roll).is_ok());
        assert_eq!(state.rolls, 1);
    }

    #[test]
    fn test_hold_banks_and_wins() {
        let mut rng = DeterministicRng::new(3);
        let mut state = new_game(&mut rng);
        state.turn_total = DEFAULT_TARGET;
        assert!(call(&mut state, &mut rng, "alice", DiceMethod::Hold).is_ok());
        assert_eq!(state.winner, Some(UserId::from("alice")));
        assert_eq!(
            call(&mut state, &mut rng, "alice", DiceMethod::Roll),
            Response::error("game is over")
        );
    }

    #[test]
    fn test_set_target_rules() {
        let mut rng = DeterministicRng::new(4);
        let mut state = new_game(&mut rng);
        call(&mut state, &mut rng, "bob", DiceMethod::Join);
        assert_eq!(
            call(&mut state, &mut rng, "bob", DiceMethod::SetTarget { target: 5 }),
            Response::error("only the host can change the target")
        );
        assert!(call(&mut state, &mut rng, "alice", DiceMethod::SetTarget { target: 5 }).is_ok());
        assert_eq!(state.target, 5);
    }

    #[test]
    fn test_tick_forfeits_turn() {
        let mut rng = DeterministicRng::new(5);
        let mut state = new_game(&mut rng);
        call(&mut state, &mut rng, "bob", DiceMethod::Join);
        state.turn_total = 9;
        let mut ctx = Context::new(&mut rng, 0);
        DiceGame.on_tick(&mut state, &mut ctx, TURN_SECONDS - 1.0);
        assert_eq!(state.turn, 0);
        DiceGame.on_tick(&mut state, &mut ctx, 1.0);
        assert_eq!(state.turn, 1);
        assert_eq!(state.turn_total, 0);
    }

    #[test]
    fn test_method_decoding() {
        let (tag, args) = DiceMethod::SetTarget { target: 77 }.to_call();
        assert_eq!(DiceMethod::decode(tag, &args), Ok(DiceMethod::SetTarget { target: 77 }));
        let (tag, args) = DiceMethod::Hold.to_call();
        assert_eq!(DiceMethod::decode(tag, &args), Ok(DiceMethod::Hold));
        assert_eq!(DiceMethod::decode(9, &[]), Err(MethodError::UnknownMethod(9)));
        assert!(matches!(
            DiceMethod::decode(tags::SET_TARGET, &[]),
            Err(MethodError::Malformed(_))
        ));
    }

    #[test]
    fn test_projection_redacts_per_user() {
        let mut rng = DeterministicRng::new(6);
        let mut state = new_game(&mut rng);
        call(&mut state, &mut rng, "bob", DiceMethod::Join);

        let alice = DiceGame.project(&state, &UserId::from("alice"));
        let bob = DiceGame.project(&state, &UserId::from("bob"));
        assert!(alice.your_turn);
        assert!(!bob.your_turn);
        assert!(alice.players[0].is_you);
        assert!(bob.players[1].is_you);
        assert_eq!(alice.turn_seconds_left, TURN_SECONDS as u32);
    }
}
