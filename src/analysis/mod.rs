/// Group sub-calculators for the stage classification service.
///
/// Each submodule turns stored observations for one criteria group into a
/// 1-5 level plus a reason, and never fails: missing or stale inputs and
/// unreachable stores all degrade to level 1 with an explanatory reason.
///
/// Submodules:
/// - `heat`: heat-index formula and the persistence-based heat level.
/// - `weather`: rain, wind and heat combined into the meteorology level.
/// - `mobility`: traffic-snapshot rules and the hazard bonus.
/// - `incidents`: open-incident counts per priority bucket.

pub mod heat;
pub mod incidents;
pub mod mobility;
pub mod weather;
