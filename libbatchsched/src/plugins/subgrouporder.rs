//! Orders sub-groups: those still below their min-available first, then by
//! lowest allocated/min ratio, so the furthest-behind partition catches up.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::fit_error::SchedulerError;
use crate::plugins::{Plugin, PluginArguments};
use crate::session::Session;

pub struct SubGroupOrderPlugin;

pub fn factory(_arguments: &PluginArguments) -> Result<Box<dyn Plugin>, SchedulerError> {
    Ok(Box::new(SubGroupOrderPlugin))
}

impl Plugin for SubGroupOrderPlugin {
    fn name(&self) -> &str {
        "subgrouporder"
    }

    fn on_session_open(&mut self, session: &mut Session) {
        session.ext.sub_group_order_fns.push(Arc::new(|a, b| {
            let a_below = a.members < a.min_available;
            let b_below = b.members < b.min_available;
            match (a_below, b_below) {
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                _ => {}
            }
            ratio(a.members, a.min_available)
                .partial_cmp(&ratio(b.members, b.min_available))
                .unwrap_or(Ordering::Equal)
        }));
    }
}

fn ratio(members: u32, min_available: u32) -> f64 {
    if min_available == 0 {
        f64::INFINITY
    } else {
        members as f64 / min_available as f64
    }
}
