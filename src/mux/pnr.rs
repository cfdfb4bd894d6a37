//! PNR resolution (§4.4 "PNR resolution"): two-pass assignment with
//! conflict/missing warnings.

use std::collections::HashSet;

use crate::error::{Result, TsRelayError};

use super::service::Service;

/// Resolves `assigned_pnr` for every service in `services`, mutating them
/// in place. Pass 1 claims each service's configured-or-discovered PNR if
/// free; pass 2 assigns the lowest free PNR in `[1, 65535]` to whatever's
/// left. When `strict_pnr`, a collision on pass 1 rejects that service
/// instead of silently reassigning it (§7 `pnr_conflict`).
pub fn resolve(services: &mut [Service], strict_pnr: bool) -> Result<()> {
    let mut taken: HashSet<u16> = HashSet::new();

    // Pass 1: claim configured or discovered PNRs that are still free.
    for svc in services.iter_mut() {
        let wanted = svc.configured_pnr.or(svc.discovered_pnr);
        if let Some(pnr) = wanted {
            if pnr != 0 && taken.insert(pnr) {
                svc.assigned_pnr = Some(pnr);
            } else if pnr != 0 {
                if strict_pnr {
                    return Err(TsRelayError::PnrConflict(pnr));
                }
                log::warn!(
                    "pnr_conflict: service {} wanted PNR {} already taken, deferring to pass 2",
                    svc.input_id,
                    pnr
                );
            }
        }
    }

    // Pass 2: lowest free PNR for anyone still unclaimed.
    let mut candidate: u16 = 1;
    for svc in services.iter_mut() {
        if svc.assigned_pnr.is_some() {
            continue;
        }
        while candidate != 0 && taken.contains(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        if candidate == 0 {
            log::warn!("pnr_conflict: PNR space exhausted, service {} left unassigned", svc.input_id);
            continue;
        }
        taken.insert(candidate);
        svc.assigned_pnr = Some(candidate);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_configured_pnr_when_free() {
        let mut services = vec![Service::new("a", Some(5))];
        resolve(&mut services, false).unwrap();
        assert_eq!(services[0].assigned_pnr, Some(5));
    }

    #[test]
    fn conflict_falls_through_to_lowest_free_pnr() {
        let mut a = Service::new("a", Some(1));
        let mut b = Service::new("b", Some(1));
        b.discovered_pnr = Some(1);
        let mut services = vec![a.clone(), b.clone()];
        resolve(&mut services, false).unwrap();
        assert_eq!(services[0].assigned_pnr, Some(1));
        assert_ne!(services[1].assigned_pnr, Some(1));
        assert!(services[1].assigned_pnr.is_some());
        let _ = (&mut a, &mut b);
    }

    #[test]
    fn strict_pnr_rejects_conflict() {
        let mut services = vec![Service::new("a", Some(1)), Service::new("b", Some(1))];
        assert!(resolve(&mut services, true).is_err());
    }

    #[test]
    fn unclaimed_services_get_lowest_free_pnr_in_order() {
        let mut services = vec![Service::new("a", None), Service::new("b", None)];
        resolve(&mut services, false).unwrap();
        assert_eq!(services[0].assigned_pnr, Some(1));
        assert_eq!(services[1].assigned_pnr, Some(2));
    }
}
