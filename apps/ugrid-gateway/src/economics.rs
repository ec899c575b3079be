//! Grid balance and profit attribution for one decoded snapshot.

#[derive(Debug, Clone, PartialEq)]
pub struct EconomicsReport {
    /// Positive while importing from the grid.
    pub grid_power_kw: Option<f64>,
    pub interval_profit_eur: Option<f64>,
    /// One entry per battery power, in input order.
    pub shares: Vec<Option<f64>>,
}

pub fn grid_power_kw(load_kw: Option<f64>, pv_kw: Option<f64>, battery_powers: &[Option<f64>]) -> Option<f64> {
    let (load, pv) = (load_kw?, pv_kw?);
    let battery_sum: f64 = battery_powers.iter().flatten().sum();
    Some(load + battery_sum - pv)
}

pub fn profit_eur_per_hour(grid_power_kw: f64, price_eur_per_kwh: f64) -> f64 {
    -grid_power_kw * price_eur_per_kwh
}

pub fn assess(
    load_kw: Option<f64>,
    pv_kw: Option<f64>,
    battery_powers: &[Option<f64>],
    price_eur_per_kwh: f64,
    dt_hours: f64,
) -> EconomicsReport {
    let grid = grid_power_kw(load_kw, pv_kw, battery_powers);
    let interval_profit = grid
        .filter(|_| dt_hours > 0.0)
        .map(|grid| profit_eur_per_hour(grid, price_eur_per_kwh) * dt_hours);

    let denominator: f64 = battery_powers.iter().flatten().map(|p| p.abs()).sum();
    let shares = battery_powers
        .iter()
        .map(|power| {
            let (profit, power) = (interval_profit?, (*power)?);
            if denominator == 0.0 {
                return None;
            }
            Some(profit * power.abs() / denominator)
        })
        .collect();

    EconomicsReport {
        grid_power_kw: grid,
        interval_profit_eur: interval_profit,
        shares,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn grid_power_balances_load_batteries_and_pv() {
        let grid = grid_power_kw(Some(3.0), Some(1.0), &[Some(0.3)]).unwrap();
        assert!(close(grid, 2.3));
    }

    #[test]
    fn grid_power_needs_load_and_pv() {
        assert_eq!(grid_power_kw(None, Some(1.0), &[Some(0.3)]), None);
        assert_eq!(grid_power_kw(Some(1.0), None, &[]), None);
        let grid = grid_power_kw(Some(1.0), Some(0.5), &[None, Some(-0.25)]).unwrap();
        assert!(close(grid, 0.25));
    }

    #[test]
    fn importing_costs_and_exporting_earns() {
        let importing = assess(Some(3.0), Some(1.0), &[Some(0.0)], 0.25, 1.0);
        assert!(importing.interval_profit_eur.unwrap() < 0.0);
        assert!(close(importing.interval_profit_eur.unwrap(), -0.5));

        let exporting = assess(Some(1.0), Some(3.0), &[Some(0.0)], 0.25, 0.5);
        assert!(close(exporting.interval_profit_eur.unwrap(), 0.25));
        assert!(close(profit_eur_per_hour(-2.0, 0.25), 0.5));
    }

    #[test]
    fn shares_sum_to_interval_profit() {
        let report = assess(Some(2.0), Some(0.5), &[Some(-1.5), Some(0.5), Some(2.0)], 0.3, 0.25);
        let total = report.interval_profit_eur.unwrap();
        let sum: f64 = report.shares.iter().map(|s| s.unwrap()).sum();
        assert!(close(sum, total));
        assert!(close(report.shares[2].unwrap() / report.shares[1].unwrap(), 4.0));
    }

    #[test]
    fn idle_batteries_are_not_attributable() {
        let report = assess(Some(2.0), Some(0.5), &[Some(0.0), Some(0.0)], 0.25, 0.1);
        assert!(report.interval_profit_eur.is_some());
        assert_eq!(report.shares, vec![None, None]);
    }

    #[test]
    fn missing_power_or_dt_leaves_gaps() {
        let report = assess(Some(2.0), Some(0.5), &[None, Some(1.0)], 0.25, 0.1);
        assert_eq!(report.shares[0], None);
        assert!(close(report.shares[1].unwrap(), report.interval_profit_eur.unwrap()));

        let no_dt = assess(Some(2.0), Some(0.5), &[Some(1.0)], 0.25, 0.0);
        assert!(no_dt.grid_power_kw.is_some());
        assert_eq!(no_dt.interval_profit_eur, None);
        assert_eq!(no_dt.shares, vec![None]);
    }
}
