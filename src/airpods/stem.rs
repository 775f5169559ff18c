//! Stem press routing.

use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::airpods::protocol::{Bud, PressType, StemAction};

/// Reports whether this controller currently owns the audio route.
pub trait OwnershipGate {
   fn owns_route(&self) -> bool;
}

impl OwnershipGate for bool {
   fn owns_route(&self) -> bool {
      *self
   }
}

/// Actions bound to each press on one bud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemBindings {
   #[serde(default = "single_default")]
   pub single: StemAction,
   #[serde(default = "double_default")]
   pub double: StemAction,
   #[serde(default = "triple_default")]
   pub triple: StemAction,
   #[serde(default = "long_default")]
   pub long: StemAction,
}

const fn single_default() -> StemAction {
   StemAction::default_for(PressType::Single)
}

const fn double_default() -> StemAction {
   StemAction::default_for(PressType::Double)
}

const fn triple_default() -> StemAction {
   StemAction::default_for(PressType::Triple)
}

const fn long_default() -> StemAction {
   StemAction::default_for(PressType::Long)
}

impl Default for StemBindings {
   fn default() -> Self {
      Self {
         single: single_default(),
         double: double_default(),
         triple: triple_default(),
         long: long_default(),
      }
   }
}

impl StemBindings {
   pub const fn action(&self, press: PressType) -> StemAction {
      match press {
         PressType::Single => self.single,
         PressType::Double => self.double,
         PressType::Triple => self.triple,
         PressType::Long => self.long,
      }
   }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemConfig {
   #[serde(default)]
   pub left: StemBindings,
   #[serde(default)]
   pub right: StemBindings,
}

/// Maps stem presses to host actions.
#[derive(Debug, Clone, Default)]
pub struct StemActionRouter {
   config: StemConfig,
}

impl StemActionRouter {
   pub fn new(config: StemConfig) -> Self {
      Self { config }
   }

   pub fn bindings(&self, bud: Bud) -> &StemBindings {
      match bud {
         Bud::Left => &self.config.left,
         Bud::Right => &self.config.right,
      }
   }

   /// Resolves a press. Shared media actions need the route to be owned.
   pub fn on_press(
      &self,
      gate: &impl OwnershipGate,
      bud: Bud,
      press: PressType,
   ) -> Option<StemAction> {
      let action = self.bindings(bud).action(press);
      if action.affects_shared_media() && !gate.owns_route() {
         debug!("Suppressing {action} from {bud} {press}: route not owned");
         return None;
      }
      Some(action)
   }

   /// Presses the accessory should forward because a bud rebinds them.
   pub fn stem_config_mask(&self) -> u8 {
      PressType::iter()
         .filter(|&press| {
            let default = StemAction::default_for(press);
            self.config.left.action(press) != default || self.config.right.action(press) != default
         })
         .fold(0, |mask, press| mask | press.config_bit())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_shared_media_gated() {
      let router = StemActionRouter::default();
      assert_eq!(router.on_press(&false, Bud::Left, PressType::Single), None);
      assert_eq!(
         router.on_press(&true, Bud::Left, PressType::Single),
         Some(StemAction::PlayPause)
      );
      assert_eq!(
         router.on_press(&false, Bud::Right, PressType::Long),
         Some(StemAction::CycleNoiseControlModes)
      );
   }

   #[test]
   fn test_per_bud_bindings() {
      let mut config = StemConfig::default();
      config.right.double = StemAction::DigitalAssistant;
      let router = StemActionRouter::new(config);

      assert_eq!(
         router.on_press(&false, Bud::Right, PressType::Double),
         Some(StemAction::DigitalAssistant)
      );
      assert_eq!(router.on_press(&false, Bud::Left, PressType::Double), None);
      assert_eq!(
         router.on_press(&true, Bud::Left, PressType::Double),
         Some(StemAction::NextTrack)
      );
   }

   #[test]
   fn test_stem_config_mask() {
      assert_eq!(StemActionRouter::default().stem_config_mask(), 0);

      let mut config = StemConfig::default();
      config.left.triple = StemAction::DigitalAssistant;
      config.right.single = StemAction::NextTrack;
      let router = StemActionRouter::new(config);
      assert_eq!(router.stem_config_mask(), 0x01 | 0x04);
   }
}
