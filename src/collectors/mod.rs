pub mod decoder;
pub mod session;
pub mod transport;

/// Shell script run on every node. Each section starts with a sentinel line
/// understood by [`decoder::decode`]. Commands that are missing on the node
/// simply leave their section empty.
pub const INSPECTION_SCRIPT: &str = r#"
export PATH="$PATH:/usr/local/cuda/bin:/usr/sbin:/sbin"
export LC_ALL=C
echo "___SECTION_GPU___"
nvidia-smi --query-gpu=index,uuid,name,utilization.gpu,utilization.memory,memory.used,memory.total,temperature.gpu,power.draw,power.limit --format=csv,noheader,nounits 2>/dev/null
echo "___SECTION_CPU___"
top -bn1 2>/dev/null | grep "Cpu(s)"
echo "___SECTION_MEM___"
free -m 2>/dev/null | grep Mem
echo "___SECTION_PROCESS___"
apps=$(nvidia-smi --query-compute-apps=gpu_uuid,pid,used_memory --format=csv,noheader,nounits 2>/dev/null)
if [ -n "$apps" ]; then
  echo "$apps" | while IFS=', ' read -r uuid pid mem; do
    [ -z "$pid" ] && continue
    user=$(ps -o user= -p "$pid" 2>/dev/null | tr -d ' ')
    cmd=$(ps -o args= -p "$pid" 2>/dev/null | tr ',' ' ')
    echo "$uuid,$pid,$mem,${user:-unknown},${cmd:-unknown}"
  done
else
  ps -eo pid,user,rss,args --sort=-rss 2>/dev/null | awk 'NR > 1 && NR <= 21 {
    cmd = $4
    for (i = 5; i <= NF; i++) cmd = cmd " " $i
    gsub(",", " ", cmd)
    printf "NONE,%s,%.1f,%s,%s\n", $1, $3 / 1024, $2, cmd
  }'
fi
"#;
