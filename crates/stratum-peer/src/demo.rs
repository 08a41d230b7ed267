//! Scripted orders issued by the host in single-process loopback sessions.

use stratum_sync::GameCommand;
use stratum_sync::command::{DoorState, PriorityClass, PriorityValue};

/// Ticks between two scripted orders.
pub const ORDER_INTERVAL: i64 = 20;

/// Ticks between two scripted saves.
pub const SAVE_INTERVAL: i64 = ORDER_INTERVAL * 30;

/// Whether the host saves at `tick`.
pub fn is_save_tick(tick: i64) -> bool {
    tick > 0 && tick % SAVE_INTERVAL == 0
}

/// The order to issue at `tick`, if any.
pub fn scripted_order(tick: i64) -> Option<GameCommand> {
    if tick < 0 || tick % ORDER_INTERVAL != 0 {
        return None;
    }
    let step = tick / ORDER_INTERVAL;
    let cell = (step % 100_000) as i32;
    let order = match step % 6 {
        0 => GameCommand::dig(
            vec![cell, cell + 1],
            Some(PriorityValue {
                class: PriorityClass::Basic,
                value: 5,
            }),
        ),
        1 => GameCommand::build(cell + 200_000, "Tile", 0, vec!["SandStone".into()]),
        2 => GameCommand::set_door_state(cell, DoorState::Locked),
        3 => GameCommand::chore_start(1, step as u64, "Dig", Some(cell)),
        4 => GameCommand::chore_end(1, (step - 1) as u64, true),
        _ => GameCommand::set_speed((step % 3 + 1) as u8),
    };
    Some(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_only_on_interval() {
        assert!(scripted_order(0).is_some());
        assert!(scripted_order(1).is_none());
        assert!(scripted_order(ORDER_INTERVAL - 1).is_none());
        assert!(scripted_order(ORDER_INTERVAL).is_some());
        assert!(scripted_order(-ORDER_INTERVAL).is_none());
    }

    #[test]
    fn test_save_ticks() {
        assert!(!is_save_tick(0));
        assert!(!is_save_tick(SAVE_INTERVAL - 1));
        assert!(is_save_tick(SAVE_INTERVAL));
        assert!(is_save_tick(SAVE_INTERVAL * 2));
    }

    #[test]
    fn test_orders_cycle_through_types() {
        let mut types: Vec<_> = (0..6)
            .filter_map(|step| scripted_order(step * ORDER_INTERVAL))
            .filter_map(|order| order.command_type())
            .collect();
        types.sort();
        types.dedup();
        assert_eq!(types.len(), 6);
    }

    #[test]
    fn test_orders_apply_cleanly_in_sequence() {
        let mut ledger = crate::ledger::ColonyLedger::new();
        for step in 0..60 {
            let order = scripted_order(step * ORDER_INTERVAL).unwrap();
            ledger.apply(&order).unwrap();
        }
        assert_eq!(ledger.applied(), 60);
    }
}
