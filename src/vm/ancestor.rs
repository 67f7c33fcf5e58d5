//! Super lookup.
//!
//! The frames on the stack decide where a super call continues: the walk
//! starts after the class defining the running implementation, and never
//! returns an implementation that is already running below it. Classes that
//! share one implementation through copying therefore cannot send a super
//! call back into itself.
use crate::{
    types::{ClassId, ImpId, Implementation},
    value::Selector,
    vm::CallStack,
};
use std::collections::HashSet;

impl CallStack {
    pub fn super_lookup(&self, class: ClassId, selector: Selector) -> Option<Implementation> {
        let frames = self.frames();
        let current = frames.iter().rposition(|f| f.selector == selector)?;
        let on_stack: HashSet<ImpId> = frames[..=current]
            .iter()
            .map(|f| f.implementation)
            .collect();

        let model = self.model();
        let ancestors = model.ancestors_of(class);
        let start = ancestors
            .iter()
            .position(|c| *c == frames[current].class)
            .map_or(0, |i| i + 1);

        for (i, ancestor) in ancestors.iter().enumerate().skip(start) {
            let Some(found) = model.local_method(*ancestor, selector) else {
                continue;
            };
            let inherited = ancestors[i + 1..]
                .iter()
                .find_map(|a| model.local_method(*a, selector));
            if inherited.is_some_and(|m| m.id() == found.id()) {
                continue;
            }
            if on_stack.contains(&found.id()) {
                continue;
            }
            return Some(found);
        }
        None
    }
}
