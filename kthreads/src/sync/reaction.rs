//! # Reaction.
//!
//! Threads of two kinds, reagent [`A`] and reagent [`B`], arrive one at a
//! time through [`Reaction::supply`]. As soon as enough units of both are
//! present to satisfy the [`Recipe`] (by default two `A` and one `B`, like
//! water), the reaction fires: the units are consumed, the side effect runs
//! once, and exactly the consumed threads return. Surplus units keep waiting
//! for a later reaction.
//!
//! Units are consumed oldest first. Each arriving unit takes a ticket of its
//! kind; firing serves the next `recipe` tickets of each kind. A waiter
//! returns only once its own ticket is served, so a thread that happens to
//! run between a firing and the wakeup of the consumed waiters cannot take
//! their place.
//!
//! [`A`]: Reagent::A
//! [`B`]: Reagent::B
use super::{condition_variable::ConditionVariable, mutex::Mutex};
use crate::Kernel;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Kind of a reagent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(usize)]
pub enum Reagent {
    /// The first reagent (hydrogen in water).
    A = 0,
    /// The second reagent (oxygen in water).
    B = 1,
}

impl Reagent {
    /// Both kinds.
    pub const ALL: [Reagent; 2] = [Reagent::A, Reagent::B];
}

/// Units of each reagent one reaction consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Recipe {
    /// Units of [`Reagent::A`].
    pub a: usize,
    /// Units of [`Reagent::B`].
    pub b: usize,
}

impl Recipe {
    /// Two `A` and one `B`.
    pub const WATER: Recipe = Recipe { a: 2, b: 1 };

    /// Units of `kind` one reaction consumes.
    pub fn amount(&self, kind: Reagent) -> usize {
        match kind {
            Reagent::A => self.a,
            Reagent::B => self.b,
        }
    }

    /// Returns true if `present` units are enough for one reaction.
    pub fn is_satisfied(&self, present: [usize; 2]) -> bool {
        Reagent::ALL
            .iter()
            .all(|&kind| present[usize::from(kind)] >= self.amount(kind))
    }
}

impl Default for Recipe {
    fn default() -> Self {
        Self::WATER
    }
}

struct Vessel {
    present: [usize; 2],
    tickets: [u64; 2],
    served: [u64; 2],
    reactions: usize,
    effect: Box<dyn FnMut() + Send>,
}

/// Groups arriving threads into reactions.
pub struct Reaction {
    recipe: Recipe,
    vessel: Mutex<Vessel>,
    ready: [ConditionVariable; 2],
}

impl Reaction {
    /// Creates a reaction that runs `effect` every time it fires.
    ///
    /// Both amounts of the recipe must be positive.
    pub fn new(kernel: &Kernel, recipe: Recipe, effect: impl FnMut() + Send + 'static) -> Self {
        assert!(
            recipe.a > 0 && recipe.b > 0,
            "a recipe needs both reagents: {recipe:?}"
        );
        let vessel = Mutex::new(
            kernel,
            Vessel {
                present: [0; 2],
                tickets: [0; 2],
                served: [0; 2],
                reactions: 0,
                effect: Box::new(effect),
            },
        );
        Self {
            recipe,
            ready: [ConditionVariable::new(&vessel), ConditionVariable::new(&vessel)],
            vessel,
        }
    }

    /// Supplies one unit of `kind` and waits until it is consumed by a
    /// reaction.
    pub fn supply(&self, kind: Reagent) {
        let k = usize::from(kind);
        let mut vessel = self.vessel.lock();
        let ticket = vessel.tickets[k];
        vessel.tickets[k] += 1;
        vessel.present[k] += 1;

        if self.recipe.is_satisfied(vessel.present) {
            for other in Reagent::ALL {
                let (o, amount) = (usize::from(other), self.recipe.amount(other));
                vessel.present[o] -= amount;
                vessel.served[o] += amount as u64;
            }
            vessel.reactions += 1;
            debug!(SYNC, "Reaction #{} fired by {:?}", vessel.reactions, kind);
            (vessel.effect)();
            for other in Reagent::ALL {
                let mut consumed = self.recipe.amount(other);
                if other == kind {
                    consumed -= 1;
                }
                for _ in 0..consumed {
                    self.ready[usize::from(other)].wake(&vessel);
                }
            }
        }

        vessel = self.ready[k].wait_while(vessel, |v| ticket >= v.served[k]);
        vessel.unlock();
    }

    /// Number of reactions that fired.
    pub fn reactions(&self) -> usize {
        let vessel = self.vessel.lock();
        let reactions = vessel.reactions;
        vessel.unlock();
        reactions
    }

    /// Units of `A` and `B` waiting to be consumed.
    pub fn counts(&self) -> (usize, usize) {
        let vessel = self.vessel.lock();
        let counts = (
            vessel.present[usize::from(Reagent::A)],
            vessel.present[usize::from(Reagent::B)],
        );
        vessel.unlock();
        counts
    }

    /// The recipe of this reaction.
    pub fn recipe(&self) -> Recipe {
        self.recipe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_threshold() {
        let water = Recipe::default();
        assert_eq!(water, Recipe::WATER);
        assert!(!water.is_satisfied([1, 1]));
        assert!(!water.is_satisfied([2, 0]));
        assert!(water.is_satisfied([2, 1]));
        assert!(water.is_satisfied([5, 3]));
        assert_eq!(Reagent::try_from(1).ok(), Some(Reagent::B));
        assert!(Reagent::try_from(2).is_err());
    }
}
