//! Authored gesture tables.
//!
//! Pose values are hand-tuned calibration data for the physical arms and are kept exactly
//! as measured. Left-arm poses are authored first; see [`PoseSpec`] for how the right arm
//! derives its pose per frame.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::{Gesture, Step};
use crate::messages::CommandKind;
use crate::motion::{neutral_pose, PoseSpec};
use crate::RobotId;

/// Timing knobs exposed through the `[gestures]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureTiming {
    pub heart_move_ms: u64,
    pub heart_hold_ms: u64,
    pub hello_raise_ms: u64,
    pub hello_wave_ms: u64,
    pub hello_overlap_ms: u64,
    pub hello_wave_repeat: u32,
    pub hello_wave_jitter: u16,
    pub hello_hold_neutral_ms: u64,
    /// Defaults to `max(1200, hello_raise_ms)`.
    pub hello_return_ms: Option<u64>,
    pub hungry_raise_ms: u64,
    pub hungry_overlap_ms: u64,
    pub hungry_rub_ms: u64,
    pub hungry_rub_repeat: u32,
    pub hungry_hold_between_ms: u64,
    pub hungry_return_hold_ms: u64,
    pub ate_move_ms: u64,
    pub ate_pat_ms: u64,
    pub ate_pat_repeat: u32,
}

impl Default for GestureTiming {
    fn default() -> Self {
        Self {
            heart_move_ms: 1000,
            heart_hold_ms: 3000,
            hello_raise_ms: 900,
            hello_wave_ms: 420,
            hello_overlap_ms: 140,
            hello_wave_repeat: 10,
            hello_wave_jitter: 6,
            hello_hold_neutral_ms: 0,
            hello_return_ms: None,
            hungry_raise_ms: 900,
            hungry_overlap_ms: 140,
            hungry_rub_ms: 420,
            hungry_rub_repeat: 2,
            hungry_hold_between_ms: 0,
            hungry_return_hold_ms: 0,
            ate_move_ms: 800,
            ate_pat_ms: 400,
            ate_pat_repeat: 4,
        }
    }
}

/// Every gesture command, keyed by its [`CommandKind`].
#[derive(Debug, Clone)]
pub struct GestureCatalog {
    gestures: HashMap<CommandKind, Gesture>,
}

impl Default for GestureCatalog {
    fn default() -> Self {
        Self::new(&GestureTiming::default())
    }
}

impl GestureCatalog {
    pub fn new(timing: &GestureTiming) -> Self {
        let gestures = [
            init_pose(),
            heart(timing),
            hug(),
            hello(timing),
            rock(),
            paper(),
            scissors(),
            good_morning(),
            good_night(),
            hungry(timing),
            ate_all(timing),
        ]
        .into_iter()
        .map(|g| (g.command, g))
        .collect();
        Self { gestures }
    }

    pub fn get(&self, command: CommandKind) -> Option<&Gesture> {
        self.gestures.get(&command)
    }

    pub fn len(&self) -> usize {
        self.gestures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gestures.is_empty()
    }
}

fn frame(pose: PoseSpec, move_ms: u64, overlap_ms: u64) -> Step {
    Step::frame(pose, move_ms, overlap_ms)
}

fn m(angles: [u16; 6]) -> PoseSpec {
    PoseSpec::mirrored(angles)
}

fn neutral_both() -> PoseSpec {
    PoseSpec::Asymmetric {
        left: neutral_pose(RobotId::Left),
        right: neutral_pose(RobotId::Right),
    }
}

fn init_pose() -> Gesture {
    Gesture::new(
        CommandKind::InitPose,
        "init",
        vec![frame(neutral_both(), 2000, 0), Step::Hold(300)],
    )
}

fn heart(t: &GestureTiming) -> Gesture {
    let raise = [87, 131, 1, 22, 90, 1];
    let spread = [0, 55, 65, 97, 90, 1];
    let heart = [0, 55, 44, 0, 0, 177];
    Gesture::new(
        CommandKind::MakeHeart,
        "heart",
        vec![
            frame(m(raise), t.heart_move_ms, 100),
            frame(m(spread), t.heart_move_ms, 100),
            frame(m(heart), t.heart_move_ms, 100),
            Step::Hold(t.heart_hold_ms),
            frame(m(spread), t.heart_move_ms, 100),
            Step::Neutral {
                move_ms: t.heart_move_ms,
            },
        ],
    )
}

fn hug() -> Gesture {
    let open = [90, 90, 85, 65, 90, 30];
    let light = [90, 27, 78, 70, 90, 80];
    let full = [90, 26, 66, 58, 90, 110];
    Gesture::new(
        CommandKind::MakeHug,
        "hug",
        vec![
            frame(m(open), 1800, 100),
            frame(m(light), 3000, 150),
            frame(m(full), 3000, 150),
            frame(m(light), 3000, 150),
            Step::Neutral { move_ms: 2000 },
        ],
    )
}

fn hello(t: &GestureTiming) -> Gesture {
    let raise = [0, 25, 60, 90, 0, 90];
    let seeds = vec![
        [0, 15, 65, 50, 0, 125],
        [0, 27, 88, 105, 0, 29],
        [0, 20, 93, 92, 0, 70],
        [4, 31, 75, 80, 0, 40],
    ];
    let wave_overlap = t
        .hello_overlap_ms
        .min(t.hello_wave_ms.saturating_sub(20));
    let return_ms = t.hello_return_ms.unwrap_or(t.hello_raise_ms.max(1200));
    Gesture::new(
        CommandKind::MakeHello,
        "hello",
        vec![
            frame(m(raise), t.hello_raise_ms, t.hello_overlap_ms),
            Step::Wave {
                seeds,
                repeat: t.hello_wave_repeat,
                move_ms: t.hello_wave_ms,
                overlap_ms: wave_overlap,
                jitter: t.hello_wave_jitter,
            },
            Step::Neutral { move_ms: return_ms },
            Step::Hold(t.hello_hold_neutral_ms),
        ],
    )
}

const RPS_READY: [u16; 6] = [46, 45, 90, 45, 89, 90];

fn rock() -> Gesture {
    Gesture::new(
        CommandKind::Rock,
        "rock",
        vec![
            frame(m(RPS_READY), 1500, 100),
            frame(m([180, 45, 80, 0, 90, 90]), 400, 80),
        ],
    )
}

fn paper() -> Gesture {
    Gesture::new(
        CommandKind::Paper,
        "paper",
        vec![
            frame(m(RPS_READY), 1500, 100),
            frame(PoseSpec::shared([90, 90, 90, 90, 90, 0]), 400, 80),
        ],
    )
}

fn scissors() -> Gesture {
    Gesture::new(
        CommandKind::Scissors,
        "scissors",
        vec![
            frame(m(RPS_READY), 1500, 100),
            frame(
                PoseSpec::asymmetric([90, 0, 90, 90, 180, 180], [90, 0, 90, 90, 0, 180]),
                400,
                80,
            ),
        ],
    )
}

fn good_morning() -> Gesture {
    let rotate = PoseSpec::asymmetric([50, 103, 0, 18, 76, 67], [180, 180, 15, 0, 123, 90]);
    let stretch = [
        PoseSpec::asymmetric([0, 66, 56, 19, 76, 66], [180, 65, 52, 60, 90, 0]),
        PoseSpec::asymmetric([0, 34, 73, 76, 0, 1], [179, 27, 48, 74, 179, 36]),
        PoseSpec::asymmetric([0, 18, 108, 94, 0, 55], [179, 29, 85, 83, 179, 57]),
    ];
    let mut steps = vec![Step::ForSide {
        left: vec![frame(rotate, 1600, 100)],
        right: vec![frame(rotate, 1800, 100)],
    }];
    steps.extend(stretch.into_iter().map(|pose| frame(pose, 1200, 100)));
    steps.push(Step::Neutral { move_ms: 1800 });
    Gesture::new(CommandKind::GoodMorning, "good_morning", steps)
}

fn good_night() -> Gesture {
    let yawn = [135, 34, 0, 80, 119, 40];
    let sway_a = [134, 29, 3, 81, 133, 91];
    let sway_b = [134, 29, 3, 81, 133, 120];
    // Right arm only; the left arm just settles at neutral.
    Gesture::new(
        CommandKind::GoodNight,
        "good_night",
        vec![Step::ForSide {
            left: vec![frame(neutral_both(), 800, 0)],
            right: vec![
                frame(PoseSpec::shared(yawn), 1800, 100),
                Step::Repeat {
                    times: 3,
                    steps: vec![
                        frame(PoseSpec::shared(sway_a), 600, 80),
                        frame(PoseSpec::shared(sway_b), 600, 80),
                    ],
                },
                Step::Neutral { move_ms: 1200 },
            ],
        }],
    )
}

fn hungry(t: &GestureTiming) -> Gesture {
    let raise = [147, 36, 40, 52, 90, 16];
    let rub_a = [138, 0, 52, 54, 144, 17];
    let rub_b = [141, 4, 79, 21, 144, 76];
    let rub_overlap = if t.hungry_rub_ms > 40 {
        (t.hungry_rub_ms - 20).min(100)
    } else {
        0
    };
    let rounds = t.hungry_rub_repeat.max(1);

    let mut steps = vec![frame(m(raise), t.hungry_raise_ms, t.hungry_overlap_ms)];
    for round in 0..rounds {
        steps.push(frame(m(rub_a), t.hungry_rub_ms, rub_overlap));
        steps.push(Step::Hold(t.hungry_hold_between_ms));
        steps.push(frame(m(rub_b), t.hungry_rub_ms, rub_overlap));
        if round + 1 < rounds {
            steps.push(Step::Hold(t.hungry_hold_between_ms));
        }
    }
    steps.push(frame(m(raise), t.hungry_raise_ms, t.hungry_overlap_ms));
    steps.push(Step::Neutral {
        move_ms: t.hungry_raise_ms,
    });
    steps.push(Step::Hold(t.hungry_return_hold_ms));
    Gesture::new(CommandKind::Hungry, "hungry", steps)
}

fn ate_all(t: &GestureTiming) -> Gesture {
    let raise = [138, 5, 91, 60, 90, 90];
    let pat_off = PoseSpec::asymmetric([123, 18, 61, 40, 111, 180], [57, 18, 61, 40, 66, 178]);
    let pat_on = PoseSpec::asymmetric([132, 23, 53, 23, 111, 83], [45, 24, 56, 17, 68, 89]);
    Gesture::new(
        CommandKind::AteAll,
        "ate_all",
        vec![
            frame(m(raise), t.ate_move_ms, 100),
            Step::Repeat {
                times: t.ate_pat_repeat,
                steps: vec![
                    frame(pat_off, t.ate_pat_ms, 80),
                    frame(pat_on, t.ate_pat_ms, 80),
                ],
            },
            frame(m(raise), t.ate_move_ms, 100),
            Step::Neutral {
                move_ms: t.ate_move_ms,
            },
        ],
    )
}
