//! Aggregate reports over the scan database.

use crate::error::Result;
use crate::miner::UNKNOWN_POOL;
use crate::store::block_time_rfc3339;
use crate::store::Database;
use bitcoin::Amount;
use rusqlite::params;
use std::fmt::{self, Display, Formatter};

/// `(label, min, max)`, inclusive bounds.
pub const SIZE_BUCKETS: [(&str, u64, u64); 5] = [
    ("84-200 bytes", 84, 200),
    ("200-1K bytes", 201, 1023),
    ("1K-10K bytes", 1024, 10239),
    ("10K-50K bytes", 10240, 51199),
    ("50K-100K bytes", 51200, 102400),
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overview {
    pub total_blocks: u64,
    pub total_payloads: u64,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    pub first_block_time: Option<i64>,
    pub last_block_time: Option<i64>,
}

impl Overview {
    pub fn collect(db: &Database) -> Result<Self> {
        let conn = db.conn();
        let (total_blocks, total_payloads, first_block, last_block) = conn.query_row(
            "select count(*), coalesce(sum(large_op_returns_found), 0), min(block_number), max(block_number)
            from op_return_scans",
            params![],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;
        let time_of = |block: Option<u64>| -> Result<Option<i64>> {
            let Some(block) = block else {
                return Ok(None);
            };
            Ok(db.scan_record(block)?.map(|x| x.block_time))
        };
        Ok(Self {
            total_blocks,
            total_payloads,
            first_block,
            last_block,
            first_block_time: time_of(first_block)?,
            last_block_time: time_of(last_block)?,
        })
    }

    pub fn avg_per_block(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.total_payloads as f64 / self.total_blocks as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolActivity {
    pub pool: String,
    pub blocks: u64,
    pub payloads: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeeStats {
    /// Payloads with fee data.
    pub count: u64,
    pub total_fees: u64,
    pub avg_fee: f64,
    pub avg_fee_rate: f64,
    pub min_fee_rate: f64,
    pub max_fee_rate: f64,
    pub avg_cost_per_byte: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthActivity {
    /// `YYYY-MM`
    pub month: String,
    pub blocks: u64,
    pub payloads: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    pub overview: Overview,
    pub pools: Vec<PoolActivity>,
    pub file_types: Vec<(String, u64)>,
    /// Counts in [`SIZE_BUCKETS`] order.
    pub sizes: [u64; SIZE_BUCKETS.len()],
    pub fees: Option<FeeStats>,
    pub monthly: Vec<MonthActivity>,
}

impl Statistics {
    pub fn collect(db: &Database) -> Result<Self> {
        let conn = db.conn();

        let mut stmt = conn.prepare(
            "select coalesce(mined_by, ?1) as pool, count(*), sum(large_op_returns_found)
            from op_return_scans group by pool order by count(*) desc, pool",
        )?;
        let pools = stmt
            .query_map(params![UNKNOWN_POOL], |r| {
                Ok(PoolActivity {
                    pool: r.get(0)?,
                    blocks: r.get(1)?,
                    payloads: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = conn.prepare(
            "select file_type, count(*) from large_op_returns group by file_type
            order by count(*) desc, file_type",
        )?;
        let file_types = stmt
            .query_map(params![], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        let mut sizes = [0_u64; SIZE_BUCKETS.len()];
        for (count, (_, min, max)) in sizes.iter_mut().zip(SIZE_BUCKETS) {
            *count = conn.query_row(
                "select count(*) from large_op_returns where data_size between ? and ?",
                params![min, max],
                |r| r.get(0),
            )?;
        }

        let fees = conn.query_row(
            "select count(*), sum(tx_fee), avg(tx_fee), avg(fee_rate), min(fee_rate), max(fee_rate),
            avg(cost_per_byte) from large_op_returns where tx_fee is not null",
            params![],
            |r| {
                let count: u64 = r.get(0)?;
                if count == 0 {
                    return Ok(None);
                }
                Ok(Some(FeeStats {
                    count,
                    total_fees: r.get(1)?,
                    avg_fee: r.get(2)?,
                    avg_fee_rate: r.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                    min_fee_rate: r.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                    max_fee_rate: r.get::<_, Option<f64>>(5)?.unwrap_or_default(),
                    avg_cost_per_byte: r.get::<_, Option<f64>>(6)?.unwrap_or_default(),
                }))
            },
        )?;

        let mut stmt = conn.prepare(
            "select strftime('%Y-%m', block_time, 'unixepoch') as month, count(*),
            sum(large_op_returns_found) from op_return_scans
            where large_op_returns_found > 0 group by month order by month",
        )?;
        let monthly = stmt
            .query_map(params![], |r| {
                Ok(MonthActivity {
                    month: r.get(0)?,
                    blocks: r.get(1)?,
                    payloads: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        Ok(Self {
            overview: Overview::collect(db)?,
            pools,
            file_types,
            sizes,
            fees,
            monthly,
        })
    }
}

fn bar(count: u64, max: u64, width: u64) -> String {
    if max == 0 {
        return String::new();
    }
    "#".repeat((count * width / max) as usize)
}

impl Display for Overview {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total blocks scanned:      {}", self.total_blocks)?;
        writeln!(f, "Total large OP_RETURNs:    {}", self.total_payloads)?;
        if let (Some(first), Some(last)) = (self.first_block, self.last_block) {
            writeln!(f, "Block range:               {first} - {last}")?;
        }
        if let (Some(first), Some(last)) = (self.first_block_time, self.last_block_time) {
            writeln!(
                f,
                "Date range:                {} to {}",
                block_time_rfc3339(first),
                block_time_rfc3339(last)
            )?;
        }
        write!(f, "Average per block:         {:.2}", self.avg_per_block())
    }
}

impl Display for Statistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "OP_RETURN Scan Statistics")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "{}", self.overview)?;

        writeln!(f, "\nMining pools:")?;
        for x in &self.pools {
            writeln!(
                f,
                "   {:.<25} {:>4} blocks, {:>4} OP_RETURNs",
                x.pool, x.blocks, x.payloads
            )?;
        }

        writeln!(f, "\nFile types:")?;
        for (file_type, count) in &self.file_types {
            writeln!(f, "   {file_type:.<20} {count:>5}")?;
        }

        writeln!(f, "\nSize distribution:")?;
        let max = self.sizes.iter().copied().max().unwrap_or(0);
        for ((label, ..), count) in SIZE_BUCKETS.iter().zip(self.sizes) {
            writeln!(f, "   {label:.<20} {count:>5}  {}", bar(count, max, 40))?;
        }

        writeln!(f, "\nTransaction fees:")?;
        match &self.fees {
            Some(x) => {
                writeln!(f, "   Transactions with fee data: {}", x.count)?;
                writeln!(
                    f,
                    "   Total fees paid:            {} sats ({})",
                    x.total_fees,
                    Amount::from_sat(x.total_fees).display_in(bitcoin::Denomination::Bitcoin)
                )?;
                writeln!(f, "   Average fee:                {:.0} sats", x.avg_fee)?;
                writeln!(f, "   Average fee rate:           {:.2} sat/vB", x.avg_fee_rate)?;
                writeln!(
                    f,
                    "   Fee rate range:             {:.2} - {:.2} sat/vB",
                    x.min_fee_rate, x.max_fee_rate
                )?;
                writeln!(
                    f,
                    "   Avg cost per byte of data:  {:.2} sats/byte",
                    x.avg_cost_per_byte
                )?;
            }
            None => writeln!(f, "   No fee data available yet")?,
        }

        write!(f, "\nActivity by month:")?;
        if self.monthly.is_empty() {
            write!(f, "\n   No activity yet")?;
        }
        let max = self.monthly.iter().map(|x| x.payloads).max().unwrap_or(0);
        for x in &self.monthly {
            write!(
                f,
                "\n   {}.......... {:>4} OP_RETURNs in {:>3} blocks  {}",
                x.month,
                x.payloads,
                x.blocks,
                bar(x.payloads, max, 30)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::db::test::{payload, scan};
    use crate::store::db::{insert_payload, insert_scan};

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn();

        let mut first = scan(100);
        first.large_payload_count = 2;
        first.block_time = 1_704_067_200; // 2024-01-01
        let id = insert_scan(conn, &first).unwrap();
        let mut big = payload(100, "aa", 0);
        big.data_size = 20_000;
        big.file_type = "png".into();
        insert_payload(conn, id, &big, 0).unwrap();
        insert_payload(conn, id, &payload(100, "aa", 1), 0).unwrap();

        let mut second = scan(101);
        second.mined_by = None;
        second.block_time = 1_706_745_600; // 2024-02-01
        insert_scan(conn, &second).unwrap();

        let mut third = scan(102);
        third.large_payload_count = 1;
        third.block_time = 1_706_745_600;
        let id = insert_scan(conn, &third).unwrap();
        let mut free = payload(102, "bb", 0);
        free.data_size = 300;
        free.tx_fee = None;
        free.fee_rate = None;
        free.cost_per_byte = None;
        insert_payload(conn, id, &free, 0).unwrap();
        db
    }

    #[test]
    fn overview() {
        let overview = Overview::collect(&seeded()).unwrap();
        assert_eq!(overview.total_blocks, 3);
        assert_eq!(overview.total_payloads, 3);
        assert_eq!(overview.first_block, Some(100));
        assert_eq!(overview.last_block, Some(102));
        assert_eq!(overview.first_block_time, Some(1_704_067_200));
        assert_eq!(overview.avg_per_block(), 1.0);

        let empty = Overview::collect(&Database::open_in_memory().unwrap()).unwrap();
        assert_eq!(empty, Overview::default());
        assert_eq!(empty.avg_per_block(), 0.0);
    }

    #[test]
    fn breakdowns() {
        let stats = Statistics::collect(&seeded()).unwrap();
        assert_eq!(
            stats.pools,
            [
                PoolActivity {
                    pool: "F2Pool".into(),
                    blocks: 2,
                    payloads: 3
                },
                PoolActivity {
                    pool: UNKNOWN_POOL.into(),
                    blocks: 1,
                    payloads: 0
                },
            ]
        );
        assert_eq!(
            stats.file_types,
            [("binary".to_string(), 2), ("png".to_string(), 1)]
        );
        assert_eq!(stats.sizes, [1, 1, 0, 1, 0]);

        let fees = stats.fees.clone().unwrap();
        assert_eq!(fees.count, 2);
        assert_eq!(fees.total_fees, 10_000);
        assert_eq!(fees.avg_fee_rate, 20.0);

        assert_eq!(
            stats.monthly,
            [
                MonthActivity {
                    month: "2024-01".into(),
                    blocks: 1,
                    payloads: 2
                },
                MonthActivity {
                    month: "2024-02".into(),
                    blocks: 1,
                    payloads: 1
                },
            ]
        );

        let rendered = stats.to_string();
        assert!(rendered.contains("Total large OP_RETURNs:    3"));
        assert!(rendered.contains("2024-02"));
    }

    #[test]
    fn no_fee_data() {
        let stats = Statistics::collect(&Database::open_in_memory().unwrap()).unwrap();
        assert_eq!(stats.fees, None);
        assert!(stats.monthly.is_empty());
        assert!(stats.to_string().contains("No fee data available yet"));
    }

    #[test]
    fn unattributed_and_unmatched_blocks_share_one_pool_row() {
        let db = seeded();
        let mut unmatched = scan(103);
        unmatched.mined_by = Some(UNKNOWN_POOL.into());
        unmatched.large_payload_count = 4;
        insert_scan(db.conn(), &unmatched).unwrap();

        let stats = Statistics::collect(&db).unwrap();
        let unknown = stats
            .pools
            .iter()
            .filter(|x| x.pool == UNKNOWN_POOL)
            .collect::<Vec<_>>();
        assert_eq!(
            unknown,
            [&PoolActivity {
                pool: UNKNOWN_POOL.into(),
                blocks: 2,
                payloads: 4
            }]
        );
        assert_eq!(stats.pools.len(), 2);
    }
}
